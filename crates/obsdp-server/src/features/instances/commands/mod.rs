pub mod activate;

pub use activate::{ActivateInstanceCommand, ActivateInstanceResponse};
