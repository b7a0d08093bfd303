use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::features::FeatureState;
use crate::reports::validation::ValidationParams;
use crate::scheduler::jobs::precheck_report;
use crate::scheduler::{JobPayload, JobTicket, ReportTarget};

/// Enqueue a validation report for a source or an uploaded archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateValidationReportCommand {
    pub target: ReportTarget,
    pub max_read: usize,
    pub max_valid_samples: usize,
    pub max_invalid_samples: usize,
    pub created_by: String,
    pub notify_email: Option<String>,
}

impl Request<Result<JobTicket, ObsdpError>> for CreateValidationReportCommand {}

impl CreateValidationReportCommand {
    pub fn validate(&self) -> Result<(), ObsdpError> {
        if let Some(email) = &self.notify_email {
            if !is_valid_email(email) {
                return Err(ObsdpError::invalid_argument(format!(
                    "'{email}' is not a valid email address"
                )));
            }
        }
        Ok(())
    }

    fn params(&self) -> ValidationParams {
        ValidationParams {
            max_read: self.max_read,
            max_valid_samples: self.max_valid_samples,
            max_invalid_samples: self.max_invalid_samples,
            created_by: self.created_by.clone(),
        }
    }
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
        && !email.chars().any(char::is_whitespace)
}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    command: CreateValidationReportCommand,
) -> Result<JobTicket, ObsdpError> {
    command.validate()?;
    let params = command.params();
    precheck_report(&state.pipeline, &command.target, &params).await?;

    state
        .scheduler
        .enqueue_once(
            JobPayload::ValidationReport {
                target: command.target,
                params,
                notify_email: command.notify_email,
            },
            CancellationToken::new(),
        )
        .await
}
