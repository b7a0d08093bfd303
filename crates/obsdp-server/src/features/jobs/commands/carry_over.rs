use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::features::FeatureState;
use crate::scheduler::{JobPayload, JobTicket};

/// Enqueue a copy of the masked sources from the active slot into the other one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarryOverCommand {
    pub mask: u64,
}

impl Request<Result<JobTicket, ObsdpError>> for CarryOverCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(state: FeatureState, command: CarryOverCommand) -> Result<JobTicket, ObsdpError> {
    let selection = state.pipeline.decode_selection(command.mask)?;
    if state.pipeline.process().is_running() {
        return Err(ObsdpError::already_running("a process run is in progress"));
    }

    state
        .scheduler
        .enqueue_once(
            JobPayload::CarryOver { selection },
            CancellationToken::new(),
        )
        .await
}
