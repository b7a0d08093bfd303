//! Verbatim store contract
//!
//! Harvests write into a staging generation per source; a generation becomes
//! visible to readers only when committed. A failed or cancelled harvest discards
//! its generation, so readers always see the last successful record set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsdp_common::types::SourceId;
use obsdp_common::{ObsdpError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::VerbatimRecord;

/// Per-source raw record storage
#[async_trait]
pub trait VerbatimStore: Send + Sync {
    /// Open a fresh staging generation, dropping any abandoned one
    async fn begin_generation(&self, source: SourceId) -> Result<()>;

    /// Append a batch to the open generation
    async fn append(&self, source: SourceId, batch: Vec<VerbatimRecord>) -> Result<()>;

    /// Atomically replace the committed record set with the open generation
    async fn commit(&self, source: SourceId) -> Result<usize>;

    /// Drop the open generation; the committed record set is untouched
    async fn discard(&self, source: SourceId) -> Result<()>;

    /// Committed records of a source, at most `limit` of them
    async fn read(&self, source: SourceId, limit: Option<usize>) -> Result<Vec<VerbatimRecord>>;

    /// When the committed record set was last replaced
    async fn committed_at(&self, source: SourceId) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Default)]
struct Partition {
    committed: Arc<Vec<VerbatimRecord>>,
    committed_at: Option<DateTime<Utc>>,
    staging: Option<Vec<VerbatimRecord>>,
}

/// In-memory verbatim store
#[derive(Default)]
pub struct MemoryVerbatimStore {
    partitions: RwLock<HashMap<SourceId, Partition>>,
}

impl MemoryVerbatimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a generation is open for the source
    pub async fn is_staging(&self, source: SourceId) -> bool {
        self.partitions
            .read()
            .await
            .get(&source)
            .is_some_and(|p| p.staging.is_some())
    }
}

#[async_trait]
impl VerbatimStore for MemoryVerbatimStore {
    async fn begin_generation(&self, source: SourceId) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        partitions.entry(source).or_default().staging = Some(Vec::new());
        Ok(())
    }

    async fn append(&self, source: SourceId, batch: Vec<VerbatimRecord>) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        let staging = partitions
            .get_mut(&source)
            .and_then(|p| p.staging.as_mut())
            .ok_or_else(|| {
                ObsdpError::invalid_transition(format!("no open generation for source {source}"))
            })?;
        staging.extend(batch);
        Ok(())
    }

    async fn commit(&self, source: SourceId) -> Result<usize> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.get_mut(&source).ok_or_else(|| {
            ObsdpError::invalid_transition(format!("no open generation for source {source}"))
        })?;
        let staged = partition.staging.take().ok_or_else(|| {
            ObsdpError::invalid_transition(format!("no open generation for source {source}"))
        })?;

        let count = staged.len();
        partition.committed = Arc::new(staged);
        partition.committed_at = Some(Utc::now());
        Ok(count)
    }

    async fn discard(&self, source: SourceId) -> Result<()> {
        if let Some(partition) = self.partitions.write().await.get_mut(&source) {
            partition.staging = None;
        }
        Ok(())
    }

    async fn read(&self, source: SourceId, limit: Option<usize>) -> Result<Vec<VerbatimRecord>> {
        let committed = match self.partitions.read().await.get(&source) {
            Some(partition) => partition.committed.clone(),
            None => return Ok(Vec::new()),
        };
        let take = limit.unwrap_or(committed.len());
        Ok(committed.iter().take(take).cloned().collect())
    }

    async fn committed_at(&self, source: SourceId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(&source)
            .and_then(|p| p.committed_at))
    }
}
