//! Validation reports and their storage
//!
//! - [`validation`]: generates a report from a source or an uploaded archive
//! - [`store`]: keeps report metadata and artifacts
//! - [`export`]: renders the JSON artifact

pub mod export;
pub mod store;
pub mod types;
pub mod validation;

pub use store::{FsReportStore, MemoryReportStore, ReportStore};
pub use types::{ReportArtifact, SourceRef, ValidationReport};
pub use validation::{SampleGuard, ValidationParams, ValidationReportGenerator};
