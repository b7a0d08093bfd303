//! OBSDP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the observation data platform.
//!
//! # Overview
//!
//! This crate provides functionality used across all OBSDP workspace members:
//!
//! - **Error Handling**: the pipeline error taxonomy ([`ObsdpError`], [`ErrorKind`])
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Digests**: stable content digests for published snapshots
//! - **Types**: identifiers shared by the engine and its boundary
//!
//! # Example
//!
//! ```no_run
//! use obsdp_common::{ObsdpError, Result};
//! use obsdp_common::types::SlotId;
//!
//! fn parse_selector(raw: i64) -> Result<SlotId> {
//!     SlotId::try_from(raw)
//! }
//! ```

pub mod digest;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorKind, ObsdpError, Result};
