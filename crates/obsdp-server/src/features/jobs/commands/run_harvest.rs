use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::features::FeatureState;
use crate::pipeline::registry::SourceKind;
use crate::scheduler::{JobPayload, JobTicket};

/// Enqueue a harvest of one source, by id or identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHarvestCommand {
    pub source: String,
}

impl Request<Result<JobTicket, ObsdpError>> for RunHarvestCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(state: FeatureState, command: RunHarvestCommand) -> Result<JobTicket, ObsdpError> {
    let pipeline = &state.pipeline;
    let source = pipeline.registry().resolve(&command.source)?;

    if !pipeline.harvest().has_harvester(&source.identifier) {
        return Err(ObsdpError::not_found(format!(
            "harvester for source '{}'",
            source.identifier
        )));
    }
    if source.kind == SourceKind::ArchiveUpload
        && pipeline.inbox().latest_for_source(source.id).await.is_none()
    {
        return Err(ObsdpError::not_found(format!(
            "uploaded archive for source '{}'",
            source.identifier
        )));
    }
    if pipeline.harvest().is_running(source.id) {
        return Err(ObsdpError::already_running(format!(
            "harvest of source '{}'",
            source.identifier
        )));
    }

    state
        .scheduler
        .enqueue_once(
            JobPayload::Harvest {
                source_id: source.id,
            },
            CancellationToken::new(),
        )
        .await
}
