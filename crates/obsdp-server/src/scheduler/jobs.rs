//! Job payloads and the runner that executes them

use obsdp_common::types::SourceId;
use obsdp_common::{ObsdpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CronSpec, SchedulerGateway, Timezone};
use crate::pipeline::selection::SourceSelection;
use crate::pipeline::types::{HarvestRun, ProcessRun};
use crate::pipeline::Pipeline;
use crate::reports::types::ValidationReport;
use crate::reports::validation::ValidationParams;

pub const HARVEST_SCHEDULED_JOB: &str = "harvest-scheduled";
pub const PROCESS_JOB: &str = "process";
pub const CLEANUP_REPORTS_JOB: &str = "cleanup-reports";

/// What a validation report job reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportTarget {
    Source { source: String },
    Upload { handle: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Harvest {
        source_id: SourceId,
    },
    HarvestScheduled,
    /// Sources are decoded at the boundary; the runner only revalidates them
    Process {
        selection: SourceSelection,
        clean_start: bool,
        promote: bool,
    },
    CarryOver {
        selection: SourceSelection,
    },
    ValidationReport {
        target: ReportTarget,
        params: ValidationParams,
        notify_email: Option<String>,
    },
    CleanupReports {
        older_than_days: u32,
    },
}

impl JobPayload {
    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::Harvest { .. } => "harvest",
            JobPayload::HarvestScheduled => HARVEST_SCHEDULED_JOB,
            JobPayload::Process { .. } => PROCESS_JOB,
            JobPayload::CarryOver { .. } => "carry-over",
            JobPayload::ValidationReport { .. } => "validation-report",
            JobPayload::CleanupReports { .. } => CLEANUP_REPORTS_JOB,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Harvest {
        run: HarvestRun,
    },
    HarvestScheduled {
        runs: Vec<HarvestRun>,
        rejected: BTreeMap<SourceId, String>,
    },
    Process {
        run: ProcessRun,
    },
    CarryOver {
        records: usize,
    },
    ValidationReport {
        report: ValidationReport,
    },
    CleanupReports {
        deleted: usize,
    },
}

/// Executes job payloads against the pipeline
pub struct JobRunner {
    pipeline: Arc<Pipeline>,
}

impl JobRunner {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    #[tracing::instrument(skip(self, cancel), fields(job = payload.name()))]
    pub async fn run(&self, payload: JobPayload, cancel: CancellationToken) -> Result<JobOutcome> {
        match payload {
            JobPayload::Harvest { source_id } => {
                let run = self.pipeline.harvest().harvest(source_id, cancel).await?;
                Ok(JobOutcome::Harvest { run })
            },
            JobPayload::HarvestScheduled => {
                let mut runs = Vec::new();
                let mut rejected = BTreeMap::new();
                for (id, result) in self.pipeline.harvest().harvest_scheduled(cancel).await {
                    match result {
                        Ok(run) => runs.push(run),
                        Err(err) => {
                            warn!(source_id = %id, code = err.code(), error = %err, "Scheduled harvest of source failed");
                            rejected.insert(id, err.to_string());
                        },
                    }
                }
                Ok(JobOutcome::HarvestScheduled { runs, rejected })
            },
            JobPayload::Process {
                selection,
                clean_start,
                promote,
            } => {
                let run = self
                    .pipeline
                    .process()
                    .process(selection, clean_start, promote, cancel)
                    .await?;
                Ok(JobOutcome::Process { run })
            },
            JobPayload::CarryOver { selection } => {
                let records = self.pipeline.process().carry_over(selection, cancel).await?;
                Ok(JobOutcome::CarryOver { records })
            },
            JobPayload::ValidationReport {
                target,
                params,
                notify_email,
            } => {
                let reports = self.pipeline.reports();
                let report = match target {
                    ReportTarget::Source { source } => reports.run_for_source(&source, params).await?,
                    ReportTarget::Upload { handle } => {
                        reports.run_for_uploaded_archive(&handle, params).await?
                    },
                };
                if let Some(email) = notify_email {
                    info!(report_id = %report.id, email = %email, "Report ready for notification");
                }
                Ok(JobOutcome::ValidationReport { report })
            },
            JobPayload::CleanupReports { older_than_days } => {
                let deleted = self
                    .pipeline
                    .report_store()
                    .delete_older_than(chrono::Duration::days(i64::from(older_than_days)))
                    .await?;
                info!(deleted, older_than_days, "Old validation reports removed");
                Ok(JobOutcome::CleanupReports { deleted })
            },
        }
    }
}

/// Recurring schedules registered at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSchedules {
    pub timezone: String,
    pub harvest_cron: Option<String>,
    pub process_cron: Option<String>,
    pub process_selection: SourceSelection,
    pub process_clean_start: bool,
    pub process_promote: bool,
    pub cleanup_cron: Option<String>,
    pub report_ttl_days: u32,
}

/// Register every configured recurring job; returns how many were registered
pub async fn register_recurring_jobs(
    gateway: &dyn SchedulerGateway,
    schedules: &RecurringSchedules,
) -> Result<usize> {
    let timezone = Timezone::parse(&schedules.timezone)?;
    let entries = [
        (
            HARVEST_SCHEDULED_JOB,
            schedules.harvest_cron.as_deref(),
            JobPayload::HarvestScheduled,
        ),
        (
            PROCESS_JOB,
            schedules.process_cron.as_deref(),
            JobPayload::Process {
                selection: schedules.process_selection.clone(),
                clean_start: schedules.process_clean_start,
                promote: schedules.process_promote,
            },
        ),
        (
            CLEANUP_REPORTS_JOB,
            schedules.cleanup_cron.as_deref(),
            JobPayload::CleanupReports {
                older_than_days: schedules.report_ttl_days,
            },
        ),
    ];

    let mut registered = 0;
    for (name, cron, payload) in entries {
        let Some(cron) = cron else {
            continue;
        };
        let cron = CronSpec::parse(cron)?;
        gateway
            .schedule_recurring(name, cron, timezone.clone(), payload)
            .await?;
        registered += 1;
    }
    Ok(registered)
}

/// Reject a report job before it is queued when its limits or target are bad
pub async fn precheck_report(pipeline: &Pipeline, target: &ReportTarget, params: &ValidationParams) -> Result<()> {
    pipeline.reports().guard().check(params)?;
    match target {
        ReportTarget::Source { source } => {
            pipeline.registry().resolve(source)?;
        },
        ReportTarget::Upload { handle } => {
            pipeline.inbox().get(handle).await?;
        },
    }
    if params.created_by.trim().is_empty() {
        return Err(ObsdpError::invalid_argument("created_by is required"));
    }
    Ok(())
}
