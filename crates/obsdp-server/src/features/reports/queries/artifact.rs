use mediator::Request;
use obsdp_common::types::ReportId;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::reports::types::ReportArtifact;

/// Rendered report file for download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReportArtifactQuery {
    pub id: String,
}

impl Request<Result<ReportArtifact, ObsdpError>> for GetReportArtifactQuery {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    query: GetReportArtifactQuery,
) -> Result<ReportArtifact, ObsdpError> {
    let id: ReportId = query.id.parse()?;
    state.pipeline.report_store().artifact(id).await
}
