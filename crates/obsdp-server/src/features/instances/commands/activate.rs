use mediator::Request;
use obsdp_common::types::SlotId;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;

/// Manually promote a slot that is ready to activate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateInstanceCommand {
    pub slot: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateInstanceResponse {
    pub active: SlotId,
    pub previous: SlotId,
}

impl Request<Result<ActivateInstanceResponse, ObsdpError>> for ActivateInstanceCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    command: ActivateInstanceCommand,
) -> Result<ActivateInstanceResponse, ObsdpError> {
    let slot = SlotId::try_from(command.slot)?;
    let instances = state.pipeline.instances();
    let previous = instances.active_slot();

    instances.promote(slot).await?;

    Ok(ActivateInstanceResponse {
        active: slot,
        previous,
    })
}
