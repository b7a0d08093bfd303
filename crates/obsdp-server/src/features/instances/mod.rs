pub mod commands;
pub mod queries;

pub use commands::{ActivateInstanceCommand, ActivateInstanceResponse};
pub use queries::{InstanceStatusQuery, InstanceStatusResponse};
