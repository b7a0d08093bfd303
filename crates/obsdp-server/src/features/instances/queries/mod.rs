pub mod status;

pub use status::{InstanceStatusQuery, InstanceStatusResponse, SlotStatus};
