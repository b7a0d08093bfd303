use mediator::Request;
use obsdp_common::types::ReportId;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::reports::types::ValidationReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReportQuery {
    pub id: String,
}

impl Request<Result<ValidationReport, ObsdpError>> for GetReportQuery {}

#[tracing::instrument(skip(state))]
pub async fn handle(state: FeatureState, query: GetReportQuery) -> Result<ValidationReport, ObsdpError> {
    let id: ReportId = query.id.parse()?;
    state.pipeline.report_store().get(id).await
}
