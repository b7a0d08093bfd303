use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::features::FeatureState;
use crate::scheduler::{JobPayload, JobTicket};

/// Enqueue a process run over the sources named by `mask`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProcessCommand {
    pub mask: u64,
    #[serde(default = "default_true")]
    pub clean_start: bool,
    #[serde(default = "default_true")]
    pub promote: bool,
}

fn default_true() -> bool {
    true
}

impl Request<Result<JobTicket, ObsdpError>> for RunProcessCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(state: FeatureState, command: RunProcessCommand) -> Result<JobTicket, ObsdpError> {
    let selection = state.pipeline.decode_selection(command.mask)?;
    if state.pipeline.process().is_running() {
        return Err(ObsdpError::already_running("a process run is in progress"));
    }

    state
        .scheduler
        .enqueue_once(
            JobPayload::Process {
                selection,
                clean_start: command.clean_start,
                promote: command.promote,
            },
            CancellationToken::new(),
        )
        .await
}
