pub mod get;
pub mod list;

pub use get::GetSourceQuery;
pub use list::{ListSourcesQuery, ListSourcesResponse};
