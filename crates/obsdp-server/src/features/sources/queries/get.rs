use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::pipeline::registry::Source;

/// Look a source up by numeric id or identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSourceQuery {
    pub source: String,
}

impl Request<Result<Source, ObsdpError>> for GetSourceQuery {}

#[tracing::instrument(skip(state))]
pub async fn handle(state: FeatureState, query: GetSourceQuery) -> Result<Source, ObsdpError> {
    state.pipeline.registry().resolve(&query.source)
}
