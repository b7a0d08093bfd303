//! Scheduler contract
//!
//! The engine never fires jobs itself. Boundary commands hand work to a
//! [`SchedulerGateway`], which either runs it on a worker or records it for a
//! cron engine. Recurring registrations are keyed by name; registering a name
//! again replaces its schedule.

pub mod jobs;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use obsdp_common::{ObsdpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

pub use jobs::{JobOutcome, JobPayload, JobRunner, ReportTarget};

/// Handle to an enqueued one-shot job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    pub id: Uuid,
    pub job: String,
    pub enqueued_at: DateTime<Utc>,
}

impl JobTicket {
    fn new(payload: &JobPayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            job: payload.name().to_string(),
            enqueued_at: Utc::now(),
        }
    }
}

/// A validated cron expression
///
/// Five-field expressions (minute precision) get a zero seconds field.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSpec {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(ObsdpError::invalid_argument(format!(
                    "cron expression '{trimmed}' has {n} fields, expected 5 or 6"
                )))
            },
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            ObsdpError::invalid_argument(format!("invalid cron expression '{trimmed}': {e}"))
        })?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next firing strictly after `after`, evaluated in `timezone`
    pub fn next_after(&self, after: DateTime<Utc>, timezone: &Timezone) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&timezone.offset()))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

impl PartialEq for CronSpec {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

/// Timezone a recurring schedule is evaluated in: `UTC` or a fixed offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timezone {
    name: String,
    offset: FixedOffset,
}

impl Timezone {
    pub fn utc() -> Self {
        Self {
            name: "UTC".to_string(),
            offset: Utc.fix(),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("utc") || name == "Z" {
            return Ok(Self::utc());
        }
        let offset = FixedOffset::from_str(name).map_err(|_| {
            ObsdpError::invalid_argument(format!(
                "unknown timezone '{name}', expected 'UTC' or an offset like '+01:00'"
            ))
        })?;
        Ok(Self {
            name: name.to_string(),
            offset,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// A named recurring registration
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJob {
    pub name: String,
    pub cron: CronSpec,
    pub timezone: Timezone,
    pub payload: JobPayload,
}

impl RecurringJob {
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.next_after(after, &self.timezone)
    }
}

#[async_trait]
pub trait SchedulerGateway: Send + Sync {
    /// Queue a job to run once
    async fn enqueue_once(&self, payload: JobPayload, cancel: CancellationToken) -> Result<JobTicket>;

    /// Register or replace the recurring job called `name`
    async fn schedule_recurring(
        &self,
        name: &str,
        cron: CronSpec,
        timezone: Timezone,
        payload: JobPayload,
    ) -> Result<()>;

    /// Recurring registrations, ordered by name
    async fn recurring(&self) -> Vec<RecurringJob>;
}

fn upsert(table: &Mutex<BTreeMap<String, RecurringJob>>, job: RecurringJob) {
    let mut table = table.lock().unwrap_or_else(|p| p.into_inner());
    let replaced = table.insert(job.name.clone(), job.clone()).is_some();
    info!(
        name = %job.name,
        cron = %job.cron.expression(),
        timezone = %job.timezone.name(),
        replaced,
        "Recurring job registered"
    );
}

/// Gateway that only records what it was asked to do
#[derive(Default)]
pub struct MemorySchedulerGateway {
    enqueued: Mutex<Vec<(JobTicket, JobPayload)>>,
    recurring: Mutex<BTreeMap<String, RecurringJob>>,
}

impl MemorySchedulerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueued(&self) -> Vec<(JobTicket, JobPayload)> {
        self.enqueued.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl SchedulerGateway for MemorySchedulerGateway {
    async fn enqueue_once(&self, payload: JobPayload, _cancel: CancellationToken) -> Result<JobTicket> {
        let ticket = JobTicket::new(&payload);
        self.enqueued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((ticket.clone(), payload));
        Ok(ticket)
    }

    async fn schedule_recurring(
        &self,
        name: &str,
        cron: CronSpec,
        timezone: Timezone,
        payload: JobPayload,
    ) -> Result<()> {
        upsert(
            &self.recurring,
            RecurringJob {
                name: name.to_string(),
                cron,
                timezone,
                payload,
            },
        );
        Ok(())
    }

    async fn recurring(&self) -> Vec<RecurringJob> {
        self.recurring
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Status of a job run by [`LocalSchedulerGateway`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded { outcome: JobOutcome },
    Failed { code: String, message: String },
}

/// Gateway running one-shot jobs on the tokio runtime
pub struct LocalSchedulerGateway {
    runner: Arc<JobRunner>,
    tracker: TaskTracker,
    statuses: Arc<Mutex<HashMap<Uuid, JobStatus>>>,
    recurring: Mutex<BTreeMap<String, RecurringJob>>,
}

impl LocalSchedulerGateway {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self {
            runner,
            tracker: TaskTracker::new(),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            recurring: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn status(&self, ticket: Uuid) -> Option<JobStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&ticket)
            .cloned()
    }

    /// Stop accepting work and wait for running jobs
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[async_trait]
impl SchedulerGateway for LocalSchedulerGateway {
    async fn enqueue_once(&self, payload: JobPayload, cancel: CancellationToken) -> Result<JobTicket> {
        if self.tracker.is_closed() {
            return Err(ObsdpError::invalid_transition("scheduler is shutting down"));
        }
        let ticket = JobTicket::new(&payload);
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ticket.id, JobStatus::Running);

        let runner = self.runner.clone();
        let statuses = self.statuses.clone();
        let id = ticket.id;
        let span = tracing::info_span!("job", job = %ticket.job, ticket = %id);
        self.tracker.spawn(
            async move {
                let status = match runner.run(payload, cancel).await {
                    Ok(outcome) => JobStatus::Succeeded { outcome },
                    Err(err) => {
                        if err.kind().is_rejection() {
                            warn!(code = err.code(), error = %err, "Job rejected");
                        } else {
                            error!(code = err.code(), error = %err, "Job failed");
                        }
                        JobStatus::Failed {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        }
                    },
                };
                statuses
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(id, status);
            }
            .instrument(span),
        );
        Ok(ticket)
    }

    async fn schedule_recurring(
        &self,
        name: &str,
        cron: CronSpec,
        timezone: Timezone,
        payload: JobPayload,
    ) -> Result<()> {
        upsert(
            &self.recurring,
            RecurringJob {
                name: name.to_string(),
                cron,
                timezone,
                payload,
            },
        );
        Ok(())
    }

    async fn recurring(&self) -> Vec<RecurringJob> {
        self.recurring
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cron_field_counts() {
        assert_eq!(CronSpec::parse("30 2 * * *").unwrap().expression(), "30 2 * * *");
        assert!(CronSpec::parse("0 30 2 * * *").is_ok());
        assert!(CronSpec::parse("* *").is_err());
        assert!(CronSpec::parse("61 2 * * *").is_err());
    }

    #[test]
    fn test_next_fire_honours_offset() {
        let cron = CronSpec::parse("0 2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let utc = cron.next_after(after, &Timezone::utc()).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap());

        let cet = cron.next_after(after, &Timezone::parse("+01:00").unwrap()).unwrap();
        assert_eq!(cet, Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap());
    }

    #[test]
    fn test_timezone_parse() {
        assert_eq!(Timezone::parse("utc").unwrap(), Timezone::utc());
        assert!(Timezone::parse("Europe/Stockholm").is_err());
    }

    #[tokio::test]
    async fn test_reregistering_replaces_schedule() {
        let gateway = MemorySchedulerGateway::new();
        for expr in ["0 1 * * *", "0 3 * * *"] {
            gateway
                .schedule_recurring(
                    "harvest-scheduled",
                    CronSpec::parse(expr).unwrap(),
                    Timezone::utc(),
                    JobPayload::HarvestScheduled,
                )
                .await
                .unwrap();
        }

        let recurring = gateway.recurring().await;
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].cron.expression(), "0 3 * * *");
    }
}
