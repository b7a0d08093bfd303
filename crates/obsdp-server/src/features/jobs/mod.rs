pub mod commands;
pub mod queries;

pub use commands::{
    CarryOverCommand, RunHarvestCommand, RunProcessCommand, ScheduleJobCommand, ScheduledJob,
};
pub use queries::{RunHistoryQuery, RunHistoryResponse};
