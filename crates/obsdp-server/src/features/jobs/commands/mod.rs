pub mod carry_over;
pub mod run_harvest;
pub mod run_process;
pub mod schedule;

pub use carry_over::CarryOverCommand;
pub use run_harvest::RunHarvestCommand;
pub use run_process::RunProcessCommand;
pub use schedule::{ScheduleJobCommand, ScheduledJob};
