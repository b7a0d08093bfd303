pub mod seed;

pub use seed::{SeedSourcesCommand, SeedSourcesResponse};
