use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::reports::types::ValidationReport;

/// Every report, newest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListReportsQuery {}

impl Request<Result<Vec<ValidationReport>, ObsdpError>> for ListReportsQuery {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    _query: ListReportsQuery,
) -> Result<Vec<ValidationReport>, ObsdpError> {
    state.pipeline.report_store().list_all().await
}
