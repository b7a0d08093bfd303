use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;

/// Remove every report older than `older_than_days`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOldReportsCommand {
    pub older_than_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOldReportsResponse {
    pub deleted: usize,
}

impl Request<Result<DeleteOldReportsResponse, ObsdpError>> for DeleteOldReportsCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    command: DeleteOldReportsCommand,
) -> Result<DeleteOldReportsResponse, ObsdpError> {
    if command.older_than_days == 0 {
        return Err(ObsdpError::invalid_argument("older_than_days must be positive"));
    }
    let deleted = state
        .pipeline
        .report_store()
        .delete_older_than(chrono::Duration::days(i64::from(command.older_than_days)))
        .await?;
    Ok(DeleteOldReportsResponse { deleted })
}
