pub mod commands;
pub mod queries;

pub use commands::{SeedSourcesCommand, SeedSourcesResponse};
pub use queries::{GetSourceQuery, ListSourcesQuery, ListSourcesResponse};
