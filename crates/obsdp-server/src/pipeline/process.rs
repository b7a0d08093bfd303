//! Process coordination
//!
//! A process run reads the committed verbatim records of a selection of sources,
//! transforms them into canonical records and writes them into the slot that is
//! not serving reads. Only one run exists at a time across the whole service.
//!
//! The run's output is staged in full before anything touches the slot, and is
//! then applied in one write. A failed or cancelled run leaves the slot `Failed`
//! and never touches the active slot.

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use obsdp_common::types::{SlotId, SourceId};
use obsdp_common::{ObsdpError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::RunHistory;
use super::instance::InstanceManager;
use super::normalize::{classify, Normalizer};
use super::processed::{ProcessedStore, SlotWrite};
use super::registry::{RegistrySnapshot, SourceRegistry};
use super::selection::SourceSelection;
use super::types::{CanonicalRecord, ProcessRun, RunOutcome, SourceProcessStats};
use super::verbatim::VerbatimStore;

/// Sources read concurrently by one run
pub const DEFAULT_READ_CONCURRENCY: usize = 4;

/// Records transformed between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 1_000;

/// The global process lock plus the flag `is_running` reads
///
/// The flag is cleared before the mutex is released, so it never reports idle
/// for a lock some other run already holds.
struct ProcessLock {
    running: Arc<AtomicBool>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Holds the process lock for the lifetime of a run
///
/// If the run future is dropped before it settles the slot, the slot is marked
/// failed before the lock is released so the next run cannot race the cleanup.
struct RunGuard {
    instances: Arc<InstanceManager>,
    slot: SlotId,
    lock: Option<ProcessLock>,
    settled: bool,
}

impl RunGuard {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let lock = self.lock.take();
        let instances = self.instances.clone();
        let slot = self.slot;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                instances.mark_failed(slot).await;
                drop(lock);
            });
        }
    }
}

type Staged = (
    BTreeMap<SourceId, Vec<CanonicalRecord>>,
    BTreeMap<SourceId, SourceProcessStats>,
);

pub struct ProcessCoordinator {
    registry: Arc<SourceRegistry>,
    verbatim: Arc<dyn VerbatimStore>,
    instances: Arc<InstanceManager>,
    processed: Arc<dyn ProcessedStore>,
    normalizer: Arc<dyn Normalizer>,
    history: Arc<RunHistory>,
    lock: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
    read_concurrency: usize,
}

impl ProcessCoordinator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        verbatim: Arc<dyn VerbatimStore>,
        instances: Arc<InstanceManager>,
        processed: Arc<dyn ProcessedStore>,
        normalizer: Arc<dyn Normalizer>,
        history: Arc<RunHistory>,
    ) -> Self {
        Self {
            registry,
            verbatim,
            instances,
            processed,
            normalizer,
            history,
            lock: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
            read_concurrency: DEFAULT_READ_CONCURRENCY,
        }
    }

    pub fn with_read_concurrency(mut self, read_concurrency: usize) -> Self {
        self.read_concurrency = read_concurrency.max(1);
        self
    }

    /// Whether a process or carry-over run holds the process lock
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<ProcessLock> {
        let guard = self
            .lock
            .clone()
            .try_lock_owned()
            .map_err(|_| ObsdpError::already_running("a process run is in progress"))?;
        self.running.store(true, Ordering::Release);
        Ok(ProcessLock {
            running: self.running.clone(),
            _guard: guard,
        })
    }

    /// Build a snapshot of `selection` in the inactive slot
    ///
    /// Returns the finished run for successful and cancelled runs. A failed run is
    /// recorded and its error returned.
    #[tracing::instrument(skip(self, selection, cancel), fields(sources = selection.len()))]
    pub async fn process(
        &self,
        selection: SourceSelection,
        clean_start: bool,
        promote_on_success: bool,
        cancel: CancellationToken,
    ) -> Result<ProcessRun> {
        let lock = self.acquire()?;
        let snapshot = self.registry.snapshot();
        selection.revalidate(&snapshot)?;

        let target = self.instances.target_slot();
        self.instances
            .begin_populating(target, selection.ids())
            .await?;
        let mut guard = RunGuard {
            instances: self.instances.clone(),
            slot: target,
            lock: Some(lock),
            settled: false,
        };

        let started_at = Utc::now();
        info!(slot = %target, clean_start, promote_on_success, "Process run started");

        let mut run = ProcessRun {
            selection: selection.clone(),
            target_slot: target,
            clean_start,
            promote_on_success,
            started_at,
            ended_at: started_at,
            outcome: RunOutcome::Failed,
            promoted: false,
            per_source: BTreeMap::new(),
            error: None,
        };

        let result = self
            .populate(snapshot, &selection, target, clean_start, &cancel)
            .await;

        let result = match result {
            Ok(Some(per_source)) => {
                run.per_source = per_source;
                match self.instances.mark_ready(target, Utc::now()).await {
                    Ok(()) => {
                        run.outcome = RunOutcome::Success;
                        guard.settle();
                        if promote_on_success {
                            self.promote_after_run(target).await.map(|()| run.promoted = true)
                        } else {
                            Ok(())
                        }
                    },
                    Err(err) => Err(err),
                }
            },
            Ok(None) => {
                run.outcome = RunOutcome::Cancelled;
                Ok(())
            },
            Err(err) => Err(err),
        };

        if run.outcome != RunOutcome::Success {
            self.instances.mark_failed(target).await;
            guard.settle();
        }
        drop(guard);

        run.ended_at = Utc::now();
        match result {
            Ok(()) => {
                info!(
                    outcome = run.outcome.as_str(),
                    published = run.published(),
                    promoted = run.promoted,
                    "Process run finished"
                );
                self.history.record_process(run.clone());
                Ok(run)
            },
            Err(err) => {
                if run.outcome == RunOutcome::Success {
                    // slot content is complete, only promotion failed
                    warn!(error = %err, "Promotion after process run failed");
                    run.outcome = RunOutcome::Failed;
                } else {
                    error!(error = %err, "Process run failed");
                }
                run.error = Some(err.to_string());
                self.history.record_process(run);
                Err(err)
            },
        }
    }

    /// Promote a freshly populated slot; a slot activated by someone else in the
    /// meantime counts as promoted
    async fn promote_after_run(&self, target: SlotId) -> Result<()> {
        match self.instances.promote(target).await {
            Err(ObsdpError::InvalidTransition(_)) if self.instances.active_slot() == target => {
                info!(slot = %target, "Slot already active, promotion not needed");
                Ok(())
            },
            result => result,
        }
    }

    /// Read, transform and apply; `None` when cancelled before the slot was written
    async fn populate(
        &self,
        snapshot: Arc<RegistrySnapshot>,
        selection: &SourceSelection,
        target: SlotId,
        clean_start: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<BTreeMap<SourceId, SourceProcessStats>>> {
        let task = tokio::spawn(stage(
            snapshot,
            self.verbatim.clone(),
            self.normalizer.clone(),
            selection.ids().iter().copied().collect(),
            cancel.clone(),
            self.read_concurrency,
        ));

        let staged = match task.await {
            Ok(staged) => staged?,
            Err(join_err) if join_err.is_panic() => {
                return Err(anyhow::anyhow!("process run panicked while transforming records").into())
            },
            Err(join_err) => return Err(anyhow::Error::new(join_err).into()),
        };

        let Some((partitions, per_source)) = staged else {
            return Ok(None);
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let write = SlotWrite {
            clean_start,
            partitions,
        };
        debug!(records = write.record_count(), "Applying staged output");
        self.processed.apply(target, write).await?;
        Ok(Some(per_source))
    }

    /// Copy the selection's partitions from the active slot into the target slot
    ///
    /// Runs under the process lock and leaves the target `Inactive`, ready for an
    /// incremental run on top of it.
    #[tracing::instrument(skip(self, selection, cancel), fields(sources = selection.len()))]
    pub async fn carry_over(&self, selection: SourceSelection, cancel: CancellationToken) -> Result<usize> {
        let lock = self.acquire()?;
        selection.revalidate(&self.registry.snapshot())?;

        let active = self.instances.active_slot();
        let target = active.other();
        self.instances.begin_populating(target, selection.ids()).await?;
        let mut guard = RunGuard {
            instances: self.instances.clone(),
            slot: target,
            lock: Some(lock),
            settled: false,
        };

        if cancel.is_cancelled() {
            self.instances.mark_inactive(target).await?;
            guard.settle();
            info!("Carry-over cancelled before copying");
            return Ok(0);
        }

        let copied = match self
            .processed
            .copy_sources(active, target, selection.ids())
            .await
        {
            Ok(copied) => copied,
            Err(err) => {
                self.instances.mark_failed(target).await;
                guard.settle();
                return Err(err);
            },
        };
        self.instances.mark_inactive(target).await?;
        guard.settle();

        info!(slot = %target, records = copied, "Carried partitions over from the active slot");
        Ok(copied)
    }
}

async fn stage(
    snapshot: Arc<RegistrySnapshot>,
    verbatim: Arc<dyn VerbatimStore>,
    normalizer: Arc<dyn Normalizer>,
    ids: Vec<SourceId>,
    cancel: CancellationToken,
    concurrency: usize,
) -> Result<Option<Staged>> {
    let results: Vec<Option<(SourceId, Vec<CanonicalRecord>, SourceProcessStats)>> =
        stream::iter(ids)
            .map(|id| {
                let snapshot = snapshot.clone();
                let verbatim = verbatim.clone();
                let normalizer = normalizer.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    let source = snapshot
                        .get(id)
                        .cloned()
                        .ok_or_else(|| ObsdpError::not_found(format!("source {id}")))?;
                    let records = verbatim.read(id, None).await?;

                    let mut stats = SourceProcessStats {
                        read: records.len(),
                        ..Default::default()
                    };
                    let mut canonical = Vec::with_capacity(records.len());
                    for (n, record) in records.iter().enumerate() {
                        if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                            return Ok(None);
                        }
                        match classify(normalizer.as_ref(), &source, record) {
                            Ok(c) => canonical.push(c),
                            Err(_) => stats.rejected += 1,
                        }
                    }
                    stats.published = canonical.len();
                    if stats.rejected > 0 {
                        debug!(source_id = %id, rejected = stats.rejected, "Records rejected by normalizer");
                    }
                    Ok::<_, ObsdpError>(Some((id, canonical, stats)))
                }
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await?;

    let mut partitions = BTreeMap::new();
    let mut per_source = BTreeMap::new();
    for result in results {
        let Some((id, records, stats)) = result else {
            return Ok(None);
        };
        partitions.insert(id, records);
        per_source.insert(id, stats);
    }
    Ok(Some((partitions, per_source)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::instance::SlotState;
    use crate::pipeline::normalize::DwcNormalizer;
    use crate::pipeline::processed::MemoryProcessedStore;
    use crate::pipeline::types::VerbatimRecord;
    use crate::pipeline::verbatim::MemoryVerbatimStore;
    use serde_json::json;

    struct Fixture {
        registry: Arc<SourceRegistry>,
        verbatim: Arc<MemoryVerbatimStore>,
        instances: Arc<InstanceManager>,
        processed: Arc<MemoryProcessedStore>,
        coordinator: ProcessCoordinator,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(SourceRegistry::with_defaults());
        let verbatim = Arc::new(MemoryVerbatimStore::new());
        let instances = Arc::new(InstanceManager::in_memory().await.unwrap());
        let processed = Arc::new(MemoryProcessedStore::new());
        let coordinator = ProcessCoordinator::new(
            registry.clone(),
            verbatim.clone(),
            instances.clone(),
            processed.clone(),
            Arc::new(DwcNormalizer),
            Arc::new(RunHistory::new()),
        );
        Fixture {
            registry,
            verbatim,
            instances,
            processed,
            coordinator,
        }
    }

    fn observation(id: &str) -> VerbatimRecord {
        VerbatimRecord::new(
            id,
            json!({
                "occurrenceID": id,
                "scientificName": "Perca fluviatilis",
                "eventDate": "2022-07-01",
                "decimalLatitude": 58.4,
                "decimalLongitude": 11.9
            }),
        )
    }

    async fn harvested(f: &Fixture, source: i32, records: Vec<VerbatimRecord>) {
        let id = SourceId(source);
        f.verbatim.begin_generation(id).await.unwrap();
        f.verbatim.append(id, records).await.unwrap();
        f.verbatim.commit(id).await.unwrap();
    }

    fn selection(f: &Fixture, ids: &[i32]) -> SourceSelection {
        SourceSelection::from_ids(ids.iter().map(|i| SourceId(*i)), &f.registry.snapshot()).unwrap()
    }

    #[tokio::test]
    async fn test_process_and_promote() {
        let f = fixture().await;
        harvested(&f, 3, vec![observation("a"), observation("b")]).await;

        let run = f
            .coordinator
            .process(selection(&f, &[3]), true, true, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Success);
        assert!(run.promoted);
        assert_eq!(run.target_slot, SlotId::One);
        assert_eq!(f.instances.active_slot(), SlotId::One);
        assert_eq!(f.processed.count(SlotId::One).await.unwrap(), 2);
        assert!(!f.coordinator.is_running());
    }

    #[tokio::test]
    async fn test_running_flag_follows_the_lock() {
        let f = fixture().await;
        let lock = f.coordinator.acquire().unwrap();
        assert!(f.coordinator.is_running());
        assert!(matches!(
            f.coordinator.acquire(),
            Err(ObsdpError::AlreadyRunning(_))
        ));

        drop(lock);
        assert!(!f.coordinator.is_running());
        assert!(f.coordinator.acquire().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_records_are_counted() {
        let f = fixture().await;
        let broken = VerbatimRecord::new("bad", json!({ "individualCount": "lots" }));
        harvested(&f, 3, vec![observation("a"), broken]).await;

        let run = f
            .coordinator
            .process(selection(&f, &[3]), true, false, CancellationToken::new())
            .await
            .unwrap();

        let stats = &run.per_source[&SourceId(3)];
        assert_eq!((stats.read, stats.published, stats.rejected), (2, 1, 1));
        assert_eq!(
            f.instances.slot_state(SlotId::One).await.state,
            SlotState::ReadyToActivate
        );
        assert_eq!(f.instances.active_slot(), SlotId::Zero);
    }

    #[tokio::test]
    async fn test_empty_selection_is_valid() {
        let f = fixture().await;
        let run = f
            .coordinator
            .process(selection(&f, &[]), true, false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.published(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_marks_slot_failed() {
        let f = fixture().await;
        harvested(&f, 3, vec![observation("a")]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = f
            .coordinator
            .process(selection(&f, &[3]), true, true, cancel)
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert!(!run.promoted);
        assert_eq!(f.instances.slot_state(SlotId::One).await.state, SlotState::Failed);
        assert_eq!(f.processed.count(SlotId::One).await.unwrap(), 0);
        assert_eq!(f.instances.active_slot(), SlotId::Zero);
    }

    #[tokio::test]
    async fn test_removed_source_is_rejected_before_work() {
        let f = fixture().await;
        let stale = selection(&f, &[15]);
        f.registry
            .remove(SourceId(15), &crate::reports::store::MemoryReportStore::new())
            .await
            .unwrap();

        let err = f
            .coordinator
            .process(stale, true, false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObsdpError::NotFound(_)));
        assert_eq!(f.instances.slot_state(SlotId::One).await.state, SlotState::Inactive);
    }

    #[tokio::test]
    async fn test_carry_over_then_incremental() {
        let f = fixture().await;
        harvested(&f, 1, vec![observation("p1")]).await;
        harvested(&f, 2, vec![observation("q1")]).await;
        f.coordinator
            .process(selection(&f, &[1, 2]), true, true, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.instances.active_slot(), SlotId::One);

        let copied = f
            .coordinator
            .carry_over(selection(&f, &[1]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(copied, 1);
        assert_eq!(f.instances.slot_state(SlotId::Zero).await.state, SlotState::Inactive);

        harvested(&f, 2, vec![observation("q2"), observation("q3")]).await;
        f.coordinator
            .process(selection(&f, &[2]), false, true, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.instances.active_slot(), SlotId::Zero);
        assert_eq!(f.processed.count(SlotId::Zero).await.unwrap(), 3);
    }
}
