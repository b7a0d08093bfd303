use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::pipeline::types::{HarvestRun, ProcessRun};

/// Recent runs; harvests of one source when `source` is given
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHistoryQuery {
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryResponse {
    pub harvests: Vec<HarvestRun>,
    pub processes: Vec<ProcessRun>,
}

impl Request<Result<RunHistoryResponse, ObsdpError>> for RunHistoryQuery {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    query: RunHistoryQuery,
) -> Result<RunHistoryResponse, ObsdpError> {
    let history = state.pipeline.history();
    let harvests = match query.source.as_deref() {
        Some(source) => {
            let source = state.pipeline.registry().resolve(source)?;
            history.harvests(source.id)
        },
        None => state
            .pipeline
            .registry()
            .list_all()
            .iter()
            .flat_map(|s| history.harvests(s.id))
            .collect(),
    };

    Ok(RunHistoryResponse {
        harvests,
        processes: history.processes(),
    })
}
