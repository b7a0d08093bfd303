use chrono::{DateTime, Utc};
use mediator::Request;
use obsdp_common::types::{SlotId, SourceId};
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::features::FeatureState;
use crate::pipeline::instance::SlotState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStatusQuery {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
    pub slot: SlotId,
    pub state: SlotState,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub sources: BTreeSet<SourceId>,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatusResponse {
    pub active: SlotId,
    pub process_running: bool,
    pub slots: Vec<SlotStatus>,
}

impl Request<Result<InstanceStatusResponse, ObsdpError>> for InstanceStatusQuery {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    _query: InstanceStatusQuery,
) -> Result<InstanceStatusResponse, ObsdpError> {
    let pipeline = &state.pipeline;
    let mut slots = Vec::with_capacity(2);
    for info in pipeline.instances().slots().await {
        slots.push(SlotStatus {
            slot: info.slot,
            state: info.state,
            last_completed_at: info.last_completed_at,
            sources: info.selection,
            records: pipeline.processed().count(info.slot).await?,
        });
    }

    Ok(InstanceStatusResponse {
        active: pipeline.instances().active_slot(),
        process_running: pipeline.process().is_running(),
        slots,
    })
}
