use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_REPORT_TTL_DAYS;
use crate::features::FeatureState;
use crate::scheduler::jobs::{CLEANUP_REPORTS_JOB, HARVEST_SCHEDULED_JOB, PROCESS_JOB};
use crate::scheduler::{CronSpec, JobPayload, Timezone};

/// Recurring job kinds that can be scheduled from the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduledJob {
    Harvest,
    Process {
        mask: u64,
        clean_start: bool,
        promote: bool,
    },
    CleanupReports {
        older_than_days: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJobCommand {
    pub job: ScheduledJob,
    pub cron: String,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJobResponse {
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub next_fire: Option<chrono::DateTime<chrono::Utc>>,
}

impl Request<Result<ScheduleJobResponse, ObsdpError>> for ScheduleJobCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    command: ScheduleJobCommand,
) -> Result<ScheduleJobResponse, ObsdpError> {
    let cron = CronSpec::parse(&command.cron)?;
    let timezone = match command.timezone.as_deref() {
        Some(tz) => Timezone::parse(tz)?,
        None => Timezone::utc(),
    };

    let (name, payload) = match command.job {
        ScheduledJob::Harvest => (HARVEST_SCHEDULED_JOB, JobPayload::HarvestScheduled),
        ScheduledJob::Process {
            mask,
            clean_start,
            promote,
        } => {
            let selection = state.pipeline.decode_selection(mask)?;
            (
                PROCESS_JOB,
                JobPayload::Process {
                    selection,
                    clean_start,
                    promote,
                },
            )
        },
        ScheduledJob::CleanupReports { older_than_days } => {
            let older_than_days = older_than_days.unwrap_or(DEFAULT_REPORT_TTL_DAYS);
            if older_than_days == 0 {
                return Err(ObsdpError::invalid_argument("older_than_days must be positive"));
            }
            (
                CLEANUP_REPORTS_JOB,
                JobPayload::CleanupReports { older_than_days },
            )
        },
    };

    let response = ScheduleJobResponse {
        name: name.to_string(),
        cron: cron.expression().to_string(),
        timezone: timezone.name().to_string(),
        next_fire: cron.next_after(chrono::Utc::now(), &timezone),
    };
    state
        .scheduler
        .schedule_recurring(name, cron, timezone, payload)
        .await?;
    Ok(response)
}
