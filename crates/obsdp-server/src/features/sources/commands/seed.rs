use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::pipeline::registry::SeedSummary;

/// Seed the default sources, or a single one when `source` is given
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedSourcesCommand {
    pub source: Option<String>,
    #[serde(default)]
    pub overwrite_if_exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSourcesResponse {
    pub summary: SeedSummary,
    pub registry_version: u64,
}

impl Request<Result<SeedSourcesResponse, ObsdpError>> for SeedSourcesCommand {}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: FeatureState,
    command: SeedSourcesCommand,
) -> Result<SeedSourcesResponse, ObsdpError> {
    let registry = state.pipeline.registry();
    let summary = match command.source.as_deref() {
        Some(source) => {
            let existed = registry.resolve(source).is_ok();
            registry.seed_one(source)?;
            SeedSummary {
                inserted: usize::from(!existed),
                overwritten: usize::from(existed),
                unchanged: 0,
            }
        },
        None => registry.seed_defaults(command.overwrite_if_exists)?,
    };
    state.pipeline.register_archive_harvesters();

    Ok(SeedSourcesResponse {
        summary,
        registry_version: registry.version(),
    })
}
