pub mod artifact;
pub mod get;
pub mod list;

pub use artifact::GetReportArtifactQuery;
pub use get::GetReportQuery;
pub use list::ListReportsQuery;
