//! Harvest coordination
//!
//! A harvest pulls one source's records into the verbatim store. At most one
//! harvest per source is in flight; distinct sources run in parallel and share
//! nothing but the in-flight set.
//!
//! Records are written into a staging generation that is committed only when the
//! harvester returns successfully. A failed or cancelled harvest discards its
//! generation, so processing only ever reads a complete prior harvest.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use obsdp_common::types::SourceId;
use obsdp_common::{ObsdpError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::archive::{ArchiveInbox, UploadedArchive};
use super::dwca::ArchiveParser;
use super::history::RunHistory;
use super::registry::{Source, SourceKind, SourceRegistry};
use super::types::{HarvestRun, RunOutcome, VerbatimRecord};
use super::verbatim::VerbatimStore;

/// What a harvester is asked to fetch
#[derive(Debug, Clone)]
pub struct HarvestContext {
    pub source: Source,
    /// Latest upload, for archive-upload sources
    pub archive: Option<UploadedArchive>,
}

/// Write side of a harvest's staging generation
pub struct HarvestSink {
    store: Arc<dyn VerbatimStore>,
    source_id: SourceId,
    written: AtomicUsize,
}

impl HarvestSink {
    fn new(store: Arc<dyn VerbatimStore>, source_id: SourceId) -> Self {
        Self {
            store,
            source_id,
            written: AtomicUsize::new(0),
        }
    }

    pub async fn write(&self, batch: Vec<VerbatimRecord>) -> Result<()> {
        let len = batch.len();
        self.store.append(self.source_id, batch).await?;
        self.written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }
}

/// Fetches one source's records
///
/// Implementations poll `cancel` between batches and return early once it fires.
#[async_trait]
pub trait Harvester: Send + Sync {
    async fn harvest(
        &self,
        ctx: &HarvestContext,
        sink: &HarvestSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Harvests an archive-upload source from its latest uploaded archive
pub struct ArchiveHarvester {
    inbox: Arc<ArchiveInbox>,
    parser: Arc<dyn ArchiveParser>,
    batch_size: usize,
}

impl ArchiveHarvester {
    pub fn new(inbox: Arc<ArchiveInbox>, parser: Arc<dyn ArchiveParser>) -> Self {
        Self {
            inbox,
            parser,
            batch_size: 1_000,
        }
    }
}

#[async_trait]
impl Harvester for ArchiveHarvester {
    async fn harvest(
        &self,
        ctx: &HarvestContext,
        sink: &HarvestSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let archive = ctx
            .archive
            .as_ref()
            .ok_or_else(|| ObsdpError::not_found(format!("archive for source {}", ctx.source.id)))?;
        let bytes = self.inbox.read(&archive.handle).await?;
        let parsed = self.parser.parse(archive, bytes).await?;

        let mut records = parsed.records;
        while !records.is_empty() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let rest = records.split_off(records.len().min(self.batch_size));
            sink.write(records).await?;
            records = rest;
        }
        Ok(())
    }
}

/// Fixed record set, handed out in batches
pub struct StaticHarvester {
    records: Vec<VerbatimRecord>,
    batch_size: usize,
}

impl StaticHarvester {
    pub fn new(records: Vec<VerbatimRecord>) -> Self {
        Self {
            records,
            batch_size: 500,
        }
    }
}

#[async_trait]
impl Harvester for StaticHarvester {
    async fn harvest(
        &self,
        _ctx: &HarvestContext,
        sink: &HarvestSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        for batch in self.records.chunks(self.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            sink.write(batch.to_vec()).await?;
        }
        Ok(())
    }
}

/// Removes the source from the in-flight set when the harvest ends
struct InFlight<'a> {
    set: &'a Mutex<HashSet<SourceId>>,
    source_id: SourceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.source_id);
    }
}

pub struct HarvestCoordinator {
    registry: Arc<SourceRegistry>,
    verbatim: Arc<dyn VerbatimStore>,
    inbox: Arc<ArchiveInbox>,
    history: Arc<RunHistory>,
    harvesters: RwLock<HashMap<String, Arc<dyn Harvester>>>,
    in_flight: Mutex<HashSet<SourceId>>,
    settle_delay: Duration,
}

impl HarvestCoordinator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        verbatim: Arc<dyn VerbatimStore>,
        inbox: Arc<ArchiveInbox>,
        history: Arc<RunHistory>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            registry,
            verbatim,
            inbox,
            history,
            harvesters: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            settle_delay,
        }
    }

    /// Register the harvester for a source identifier, replacing any previous one
    pub fn register_harvester(&self, identifier: &str, harvester: Arc<dyn Harvester>) {
        self.harvesters
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(identifier.to_ascii_lowercase(), harvester);
    }

    pub fn has_harvester(&self, identifier: &str) -> bool {
        self.harvesters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&identifier.to_ascii_lowercase())
    }

    fn harvester_for(&self, source: &Source) -> Result<Arc<dyn Harvester>> {
        self.harvesters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&source.identifier.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                ObsdpError::not_found(format!("harvester for source '{}'", source.identifier))
            })
    }

    pub fn is_running(&self, source_id: SourceId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&source_id)
    }

    fn claim(&self, source_id: SourceId) -> Result<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(source_id) {
            return Err(ObsdpError::already_running(format!(
                "harvest of source {source_id}"
            )));
        }
        Ok(InFlight {
            set: &self.in_flight,
            source_id,
        })
    }

    /// Harvest one source
    ///
    /// Returns the finished run for successful and cancelled harvests. A failed
    /// harvest is recorded and its error returned.
    #[tracing::instrument(skip(self, cancel), fields(source_id = %source_id))]
    pub async fn harvest(&self, source_id: SourceId, cancel: CancellationToken) -> Result<HarvestRun> {
        let source = self.registry.get(source_id)?;
        let harvester = self.harvester_for(&source)?;
        let archive = match source.kind {
            SourceKind::ArchiveUpload => Some(
                self.inbox
                    .latest_for_source(source_id)
                    .await
                    .ok_or_else(|| ObsdpError::not_found(format!("uploaded archive for source {source_id}")))?,
            ),
            _ => None,
        };

        let _in_flight = self.claim(source_id)?;
        let started_at = Utc::now();
        info!(identifier = %source.identifier, "Harvest started");

        let ctx = HarvestContext { source, archive };
        let sink = HarvestSink::new(self.verbatim.clone(), source_id);
        let result = self.run(&ctx, &sink, harvester.as_ref(), &cancel).await;

        let (outcome, error) = match result {
            Ok(()) if !cancel.is_cancelled() => match self.verbatim.commit(source_id).await {
                Ok(count) => {
                    info!(records = count, "Harvest committed");
                    (RunOutcome::Success, None)
                },
                Err(err) => (RunOutcome::Failed, Some(err)),
            },
            Ok(()) => (RunOutcome::Cancelled, None),
            Err(_) if cancel.is_cancelled() => (RunOutcome::Cancelled, None),
            Err(err) => (RunOutcome::Failed, Some(err)),
        };

        if outcome != RunOutcome::Success {
            if let Err(err) = self.verbatim.discard(source_id).await {
                warn!(error = %err, "Failed to discard staging generation");
            }
        }

        let run = HarvestRun {
            source_id,
            started_at,
            ended_at: Utc::now(),
            outcome,
            record_count: if outcome == RunOutcome::Success { sink.written() } else { 0 },
            error: error.as_ref().map(|e| e.to_string()),
        };
        self.history.record_harvest(run.clone());

        match error {
            Some(err) => {
                warn!(error = %err, "Harvest failed");
                Err(err)
            },
            None => {
                if outcome == RunOutcome::Cancelled {
                    info!("Harvest cancelled");
                }
                Ok(run)
            },
        }
    }

    async fn run(
        &self,
        ctx: &HarvestContext,
        sink: &HarvestSink,
        harvester: &dyn Harvester,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(archive) = &ctx.archive {
            let settled_at = archive.received_at
                + chrono::Duration::from_std(self.settle_delay).unwrap_or(chrono::Duration::zero());
            let remaining = (settled_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !remaining.is_zero() {
                debug!(wait_ms = remaining.as_millis() as u64, "Waiting for archive to settle");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(remaining) => {},
                }
            }
        }

        self.verbatim.begin_generation(ctx.source.id).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(()),
            result = harvester.harvest(ctx, sink, cancel) => result.map_err(ObsdpError::from_collaborator),
        }
    }

    /// Harvest every source flagged for scheduled harvesting, concurrently
    pub async fn harvest_scheduled(
        &self,
        cancel: CancellationToken,
    ) -> BTreeMap<SourceId, Result<HarvestRun>> {
        let ids: Vec<SourceId> = self
            .registry
            .snapshot()
            .scheduled_for_harvest()
            .map(|s| s.id)
            .collect();
        info!(sources = ids.len(), "Scheduled harvest started");

        let runs = join_all(ids.iter().map(|id| self.harvest(*id, cancel.clone()))).await;
        ids.into_iter().zip(runs).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::verbatim::MemoryVerbatimStore;
    use serde_json::json;

    struct Fixture {
        coordinator: Arc<HarvestCoordinator>,
        verbatim: Arc<MemoryVerbatimStore>,
        history: Arc<RunHistory>,
        _dir: tempfile::TempDir,
    }

    fn fixture(settle_delay: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let verbatim = Arc::new(MemoryVerbatimStore::new());
        let history = Arc::new(RunHistory::new());
        let coordinator = Arc::new(HarvestCoordinator::new(
            Arc::new(SourceRegistry::with_defaults()),
            verbatim.clone(),
            Arc::new(ArchiveInbox::new(dir.path())),
            history.clone(),
            settle_delay,
        ));
        Fixture {
            coordinator,
            verbatim,
            history,
            _dir: dir,
        }
    }

    fn records(n: usize) -> Vec<VerbatimRecord> {
        (0..n)
            .map(|i| VerbatimRecord::new(format!("r{i}"), json!({ "occurrenceID": i })))
            .collect()
    }

    struct FailingHarvester;

    #[async_trait]
    impl Harvester for FailingHarvester {
        async fn harvest(
            &self,
            _ctx: &HarvestContext,
            sink: &HarvestSink,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            sink.write(records(3)).await?;
            anyhow::bail!("vendor API returned 503")
        }
    }

    #[tokio::test]
    async fn test_successful_harvest_commits() {
        let f = fixture(Duration::ZERO);
        f.coordinator
            .register_harvester("Artportalen", Arc::new(StaticHarvester::new(records(1200))));

        let run = f
            .coordinator
            .harvest(SourceId(1), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.record_count, 1200);
        assert_eq!(f.verbatim.read(SourceId(1), None).await.unwrap().len(), 1200);
        assert!(!f.coordinator.is_running(SourceId(1)));
    }

    #[tokio::test]
    async fn test_failed_harvest_keeps_previous_records() {
        let f = fixture(Duration::ZERO);
        f.coordinator
            .register_harvester("Kul", Arc::new(StaticHarvester::new(records(5))));
        f.coordinator
            .harvest(SourceId(3), CancellationToken::new())
            .await
            .unwrap();

        f.coordinator.register_harvester("kul", Arc::new(FailingHarvester));
        let err = f
            .coordinator
            .harvest(SourceId(3), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), obsdp_common::ErrorKind::Upstream);
        assert_eq!(f.verbatim.read(SourceId(3), None).await.unwrap().len(), 5);
        assert_eq!(
            f.history.latest_harvest(SourceId(3)).unwrap().outcome,
            RunOutcome::Failed
        );
        assert!(!f.verbatim.is_staging(SourceId(3)).await);
    }

    #[tokio::test]
    async fn test_cancelled_harvest_discards() {
        let f = fixture(Duration::ZERO);
        f.coordinator
            .register_harvester("Nors", Arc::new(StaticHarvester::new(records(10))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = f.coordinator.harvest(SourceId(5), cancel).await.unwrap();

        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert!(f.verbatim.read(SourceId(5), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_source_and_missing_harvester() {
        let f = fixture(Duration::ZERO);
        let err = f
            .coordinator
            .harvest(SourceId(99), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObsdpError::NotFound(_)));

        let err = f
            .coordinator
            .harvest(SourceId(7), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObsdpError::NotFound(_)));
        assert!(f.history.latest_harvest(SourceId(7)).is_none());
    }

    #[tokio::test]
    async fn test_archive_source_without_upload() {
        let f = fixture(Duration::ZERO);
        f.coordinator.register_harvester(
            "Biologg",
            Arc::new(StaticHarvester::new(records(1))),
        );
        let err = f
            .coordinator
            .harvest(SourceId(12), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObsdpError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_waits_for_settle_delay_and_honours_cancel() {
        let f = fixture(Duration::from_secs(300));
        f.coordinator
            .register_harvester("Biologg", Arc::new(StaticHarvester::new(records(2))));
        f.coordinator
            .inbox
            .persist("biologg.zip", b"PK", Some(SourceId(12)))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let coordinator = f.coordinator.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { coordinator.harvest(SourceId(12), cancel).await }
        });

        while !f.coordinator.is_running(SourceId(12)) {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let run = task.await.unwrap().unwrap();
        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert!(!f.coordinator.is_running(SourceId(12)));
    }

    #[tokio::test]
    async fn test_harvest_scheduled_skips_archive_sources() {
        let f = fixture(Duration::ZERO);
        f.coordinator
            .register_harvester("Artportalen", Arc::new(StaticHarvester::new(records(4))));

        let results = f.coordinator.harvest_scheduled(CancellationToken::new()).await;

        assert!(!results.contains_key(&SourceId(12)));
        assert!(results[&SourceId(1)].is_ok());
        assert!(matches!(results[&SourceId(2)], Err(ObsdpError::NotFound(_))));
    }
}
