//! Slot content
//!
//! Canonical records live in per-source partitions inside each slot. A process
//! run stages its whole output and hands it to [`ProcessedStore::apply`], which
//! replaces the written partitions (or the whole slot, for a clean start) in one
//! step.

use async_trait::async_trait;
use obsdp_common::digest::ContentDigest;
use obsdp_common::types::{SlotId, SourceId};
use obsdp_common::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::CanonicalRecord;

/// Output of one process run
#[derive(Debug, Clone, Default)]
pub struct SlotWrite {
    /// Drop every existing partition first
    pub clean_start: bool,
    pub partitions: BTreeMap<SourceId, Vec<CanonicalRecord>>,
}

impl SlotWrite {
    pub fn record_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }
}

#[async_trait]
pub trait ProcessedStore: Send + Sync {
    /// Apply a run's output atomically
    async fn apply(&self, slot: SlotId, write: SlotWrite) -> Result<()>;

    /// Records of one partition, ordered by occurrence id
    async fn read_source(&self, slot: SlotId, source: SourceId) -> Result<Vec<CanonicalRecord>>;

    /// Every record in the slot, ordered by source then occurrence id
    async fn read_all(&self, slot: SlotId) -> Result<Vec<CanonicalRecord>>;

    async fn sources(&self, slot: SlotId) -> Result<BTreeSet<SourceId>>;

    async fn count(&self, slot: SlotId) -> Result<usize>;

    /// Replace the partitions of `sources` in `to` with those in `from`
    async fn copy_sources(&self, from: SlotId, to: SlotId, sources: &BTreeSet<SourceId>) -> Result<usize>;
}

/// Digest of a slot's content; equal digests mean equal snapshots
pub async fn content_digest(store: &dyn ProcessedStore, slot: SlotId) -> Result<String> {
    let mut digest = ContentDigest::new();
    for record in store.read_all(slot).await? {
        digest.update(&record)?;
    }
    Ok(digest.finalize())
}

type Partitions = BTreeMap<SourceId, Arc<Vec<CanonicalRecord>>>;

/// In-memory slot content
#[derive(Debug, Default)]
pub struct MemoryProcessedStore {
    slots: [RwLock<Partitions>; 2],
}

impl MemoryProcessedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut records: Vec<CanonicalRecord>) -> Vec<CanonicalRecord> {
    records.sort_by(|a, b| a.occurrence_id.cmp(&b.occurrence_id));
    records
}

#[async_trait]
impl ProcessedStore for MemoryProcessedStore {
    async fn apply(&self, slot: SlotId, write: SlotWrite) -> Result<()> {
        let staged: Partitions = write
            .partitions
            .into_iter()
            .map(|(id, records)| (id, Arc::new(sorted(records))))
            .collect();

        let mut partitions = self.slots[slot.index()].write().await;
        if write.clean_start {
            partitions.clear();
        }
        partitions.extend(staged);
        Ok(())
    }

    async fn read_source(&self, slot: SlotId, source: SourceId) -> Result<Vec<CanonicalRecord>> {
        let partitions = self.slots[slot.index()].read().await;
        Ok(partitions
            .get(&source)
            .map(|p| p.as_ref().clone())
            .unwrap_or_default())
    }

    async fn read_all(&self, slot: SlotId) -> Result<Vec<CanonicalRecord>> {
        let partitions: Vec<_> = self.slots[slot.index()]
            .read()
            .await
            .values()
            .cloned()
            .collect();
        Ok(partitions
            .iter()
            .flat_map(|p| p.iter().cloned())
            .collect())
    }

    async fn sources(&self, slot: SlotId) -> Result<BTreeSet<SourceId>> {
        Ok(self.slots[slot.index()].read().await.keys().copied().collect())
    }

    async fn count(&self, slot: SlotId) -> Result<usize> {
        Ok(self.slots[slot.index()]
            .read()
            .await
            .values()
            .map(|p| p.len())
            .sum())
    }

    async fn copy_sources(&self, from: SlotId, to: SlotId, sources: &BTreeSet<SourceId>) -> Result<usize> {
        if from == to {
            return Ok(0);
        }
        let copied: Partitions = {
            let source_slot = self.slots[from.index()].read().await;
            sources
                .iter()
                .filter_map(|id| source_slot.get(id).map(|p| (*id, p.clone())))
                .collect()
        };

        let mut target = self.slots[to.index()].write().await;
        for id in sources {
            target.remove(id);
        }
        let count = copied.values().map(|p| p.len()).sum();
        target.extend(copied);
        Ok(count)
    }
}

/// Read access pinned to the slot that was active when the reader was created
///
/// A promotion after creation does not move the reader.
#[derive(Clone)]
pub struct SlotReader {
    slot: SlotId,
    store: Arc<dyn ProcessedStore>,
}

impl SlotReader {
    pub fn new(slot: SlotId, store: Arc<dyn ProcessedStore>) -> Self {
        Self { slot, store }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub async fn read_all(&self) -> Result<Vec<CanonicalRecord>> {
        self.store.read_all(self.slot).await
    }

    pub async fn read_source(&self, source: SourceId) -> Result<Vec<CanonicalRecord>> {
        self.store.read_source(self.slot, source).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count(self.slot).await
    }
}
