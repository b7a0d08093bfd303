use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::pipeline::registry::Source;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSourcesQuery {
    /// Only sources included in the scheduled harvest
    #[serde(default)]
    pub scheduled_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSourcesResponse {
    pub sources: Vec<Source>,
    pub registry_version: u64,
}

impl Request<Result<ListSourcesResponse, ObsdpError>> for ListSourcesQuery {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    query: ListSourcesQuery,
) -> Result<ListSourcesResponse, ObsdpError> {
    let snapshot = state.pipeline.registry().snapshot();
    let sources = snapshot
        .sources()
        .iter()
        .filter(|s| !query.scheduled_only || s.include_in_scheduled_harvest)
        .cloned()
        .collect();

    Ok(ListSourcesResponse {
        sources,
        registry_version: snapshot.version(),
    })
}
