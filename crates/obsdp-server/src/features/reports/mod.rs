pub mod commands;
pub mod queries;

pub use commands::{
    CreateValidationReportCommand, DeleteOldReportsCommand, DeleteReportCommand,
};
pub use queries::{GetReportArtifactQuery, GetReportQuery, ListReportsQuery};
