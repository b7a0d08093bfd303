use mediator::Request;
use obsdp_common::types::ReportId;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReportCommand {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReportResponse {
    pub id: ReportId,
    pub deleted: bool,
}

impl Request<Result<DeleteReportResponse, ObsdpError>> for DeleteReportCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    command: DeleteReportCommand,
) -> Result<DeleteReportResponse, ObsdpError> {
    let id: ReportId = command.id.parse()?;
    state.pipeline.report_store().delete(id).await?;
    Ok(DeleteReportResponse { id, deleted: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::testing;

    #[tokio::test]
    async fn test_delete_unknown_and_malformed() {
        let t = testing::state().await;

        let err = handle(
            t.state.clone(),
            DeleteReportCommand {
                id: ReportId::generate().to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ObsdpError::NotFound(_)));

        let err = handle(
            t.state.clone(),
            DeleteReportCommand {
                id: "not-a-report".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ObsdpError::InvalidArgument(_)));
    }
}
