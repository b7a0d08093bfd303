pub mod create;
pub mod delete;
pub mod delete_old;

pub use create::CreateValidationReportCommand;
pub use delete::{DeleteReportCommand, DeleteReportResponse};
pub use delete_old::{DeleteOldReportsCommand, DeleteOldReportsResponse};
