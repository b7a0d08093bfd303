//! Boundary commands
//!
//! Each feature is a vertical slice of commands (state changes) and queries
//! (reads). Every command and query is a `mediator::Request` with a `handle`
//! function taking the shared [`FeatureState`].
//!
//! # Features
//!
//! - **sources**: seed the registry, list and look up sources
//! - **jobs**: enqueue harvest and process runs, register recurring jobs
//! - **instances**: slot status and manual activation
//! - **archives**: Darwin Core Archive uploads
//! - **reports**: validation report creation, retrieval and cleanup
//!
//! Commands that start long-running work check for a run already in progress
//! before anything is enqueued, so the caller gets `AlreadyRunning` directly.

pub mod archives;
pub mod instances;
pub mod jobs;
pub mod reports;
pub mod sources;

use std::sync::Arc;

use crate::pipeline::Pipeline;
use crate::scheduler::SchedulerGateway;

/// Shared state passed to every handler
#[derive(Clone)]
pub struct FeatureState {
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Arc<dyn SchedulerGateway>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::scheduler::MemorySchedulerGateway;

    pub struct TestState {
        pub state: FeatureState,
        pub scheduler: Arc<MemorySchedulerGateway>,
        pub _dir: tempfile::TempDir,
    }

    pub async fn state() -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder(dir.path())
            .settle_delay(std::time::Duration::ZERO)
            .build()
            .await
            .unwrap();
        let scheduler = Arc::new(MemorySchedulerGateway::new());
        TestState {
            state: FeatureState {
                pipeline: Arc::new(pipeline),
                scheduler: scheduler.clone(),
            },
            scheduler,
            _dir: dir,
        }
    }
}
