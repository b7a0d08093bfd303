//! Pipeline engine
//!
//! Harvest fills the verbatim store per source; a process run later turns a
//! selection of sources into a canonical snapshot in the slot that is not
//! serving reads and optionally promotes it.
//!
//! [`Pipeline`] wires the components together. Every collaborator is a trait
//! object so deployments and tests can swap storage without touching the core.

pub mod archive;
pub mod dwca;
pub mod harvest;
pub mod history;
pub mod instance;
pub mod normalize;
pub mod pg;
pub mod process;
pub mod processed;
pub mod registry;
pub mod selection;
pub mod types;
pub mod verbatim;

use obsdp_common::types::SlotId;
use obsdp_common::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::reports::store::{MemoryReportStore, ReportStore};
use crate::reports::validation::{SampleGuard, ValidationReportGenerator};
use archive::ArchiveInbox;
use dwca::{ArchiveParser, DwcArchiveParser};
use harvest::{ArchiveHarvester, HarvestCoordinator};
use history::RunHistory;
use instance::{InstanceManager, MemorySlotStateStore, SlotStateStore};
use normalize::{DwcNormalizer, Normalizer};
use process::{ProcessCoordinator, DEFAULT_READ_CONCURRENCY};
use processed::{MemoryProcessedStore, ProcessedStore, SlotReader};
use registry::{SourceKind, SourceRegistry};
use selection::{SelectionLayout, SourceSelection};
use verbatim::{MemoryVerbatimStore, VerbatimStore};

/// Wait after an archive upload before a harvest reads it
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// The wired engine
pub struct Pipeline {
    registry: Arc<SourceRegistry>,
    verbatim: Arc<dyn VerbatimStore>,
    inbox: Arc<ArchiveInbox>,
    history: Arc<RunHistory>,
    harvest: Arc<HarvestCoordinator>,
    instances: Arc<InstanceManager>,
    processed: Arc<dyn ProcessedStore>,
    process: Arc<ProcessCoordinator>,
    reports: Arc<ValidationReportGenerator>,
    report_store: Arc<dyn ReportStore>,
    layout: SelectionLayout,
    archive_harvester: Arc<ArchiveHarvester>,
}

impl Pipeline {
    pub fn builder(upload_dir: impl Into<PathBuf>) -> PipelineBuilder {
        PipelineBuilder::new(upload_dir)
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn verbatim(&self) -> &Arc<dyn VerbatimStore> {
        &self.verbatim
    }

    pub fn inbox(&self) -> &Arc<ArchiveInbox> {
        &self.inbox
    }

    pub fn history(&self) -> &Arc<RunHistory> {
        &self.history
    }

    pub fn harvest(&self) -> &Arc<HarvestCoordinator> {
        &self.harvest
    }

    pub fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }

    pub fn processed(&self) -> &Arc<dyn ProcessedStore> {
        &self.processed
    }

    pub fn process(&self) -> &Arc<ProcessCoordinator> {
        &self.process
    }

    pub fn reports(&self) -> &Arc<ValidationReportGenerator> {
        &self.reports
    }

    pub fn report_store(&self) -> &Arc<dyn ReportStore> {
        &self.report_store
    }

    pub fn layout(&self) -> &SelectionLayout {
        &self.layout
    }

    /// Give every archive-upload source without a harvester the shared archive
    /// harvester; returns how many were registered
    pub fn register_archive_harvesters(&self) -> usize {
        let mut registered = 0;
        for source in self.registry.list_all() {
            if source.kind == SourceKind::ArchiveUpload
                && !self.harvest.has_harvester(&source.identifier)
            {
                debug!(identifier = %source.identifier, "Registering archive harvester");
                self.harvest
                    .register_harvester(&source.identifier, self.archive_harvester.clone());
                registered += 1;
            }
        }
        registered
    }

    /// Decode a boundary bitmask against the current registry
    pub fn decode_selection(&self, mask: u64) -> Result<SourceSelection> {
        self.layout.decode(mask, &self.registry.snapshot())
    }

    /// Reader pinned to the slot active right now
    pub fn reader(&self) -> SlotReader {
        SlotReader::new(self.instances.active_slot(), self.processed.clone())
    }

    /// Content digest of `slot`, or of the active slot
    pub async fn content_digest(&self, slot: Option<SlotId>) -> Result<String> {
        let slot = slot.unwrap_or_else(|| self.instances.active_slot());
        processed::content_digest(self.processed.as_ref(), slot).await
    }
}

/// Assembles a [`Pipeline`]; every collaborator defaults to its in-memory form
pub struct PipelineBuilder {
    upload_dir: PathBuf,
    registry: Option<Arc<SourceRegistry>>,
    verbatim: Option<Arc<dyn VerbatimStore>>,
    processed: Option<Arc<dyn ProcessedStore>>,
    slot_state: Option<Arc<dyn SlotStateStore>>,
    report_store: Option<Arc<dyn ReportStore>>,
    parser: Option<Arc<dyn ArchiveParser>>,
    normalizer: Option<Arc<dyn Normalizer>>,
    layout: Option<SelectionLayout>,
    settle_delay: Duration,
    guard: SampleGuard,
    read_concurrency: usize,
}

impl PipelineBuilder {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            registry: None,
            verbatim: None,
            processed: None,
            slot_state: None,
            report_store: None,
            parser: None,
            normalizer: None,
            layout: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            guard: SampleGuard::default(),
            read_concurrency: DEFAULT_READ_CONCURRENCY,
        }
    }

    pub fn registry(mut self, registry: Arc<SourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn verbatim(mut self, verbatim: Arc<dyn VerbatimStore>) -> Self {
        self.verbatim = Some(verbatim);
        self
    }

    pub fn processed(mut self, processed: Arc<dyn ProcessedStore>) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn slot_state(mut self, store: Arc<dyn SlotStateStore>) -> Self {
        self.slot_state = Some(store);
        self
    }

    pub fn report_store(mut self, store: Arc<dyn ReportStore>) -> Self {
        self.report_store = Some(store);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn ArchiveParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn layout(mut self, layout: SelectionLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn sample_guard(mut self, guard: SampleGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn read_concurrency(mut self, read_concurrency: usize) -> Self {
        self.read_concurrency = read_concurrency;
        self
    }

    /// Restore slot state and wire the components
    ///
    /// Sources delivered as archive uploads get an [`ArchiveHarvester`] over the
    /// shared inbox; other sources need their harvesters registered by the caller.
    pub async fn build(self) -> Result<Pipeline> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(SourceRegistry::with_defaults()));
        let verbatim = self
            .verbatim
            .unwrap_or_else(|| Arc::new(MemoryVerbatimStore::new()));
        let processed = self
            .processed
            .unwrap_or_else(|| Arc::new(MemoryProcessedStore::new()));
        let slot_state = self
            .slot_state
            .unwrap_or_else(|| Arc::new(MemorySlotStateStore::new()));
        let report_store = self
            .report_store
            .unwrap_or_else(|| Arc::new(MemoryReportStore::new()));
        let parser = self.parser.unwrap_or_else(|| Arc::new(DwcArchiveParser));
        let normalizer = self.normalizer.unwrap_or_else(|| Arc::new(DwcNormalizer));
        let layout = match self.layout {
            Some(layout) => layout,
            None => SelectionLayout::from_registry(&registry.snapshot())?,
        };

        let inbox = Arc::new(ArchiveInbox::new(self.upload_dir));
        let history = Arc::new(RunHistory::new());
        let instances = Arc::new(InstanceManager::load(slot_state).await?);

        let harvest = HarvestCoordinator::new(
            registry.clone(),
            verbatim.clone(),
            inbox.clone(),
            history.clone(),
            self.settle_delay,
        );
        let archive_harvester = Arc::new(ArchiveHarvester::new(inbox.clone(), parser.clone()));

        let process = ProcessCoordinator::new(
            registry.clone(),
            verbatim.clone(),
            instances.clone(),
            processed.clone(),
            normalizer.clone(),
            history.clone(),
        )
        .with_read_concurrency(self.read_concurrency);

        let reports = ValidationReportGenerator::new(
            registry.clone(),
            verbatim.clone(),
            inbox.clone(),
            parser,
            normalizer,
            report_store.clone(),
        )
        .with_guard(self.guard);

        let pipeline = Pipeline {
            registry,
            verbatim,
            inbox,
            history,
            harvest: Arc::new(harvest),
            instances,
            processed,
            process: Arc::new(process),
            reports: Arc::new(reports),
            report_store,
            layout,
            archive_harvester,
        };
        pipeline.register_archive_harvesters();
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_builder_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder(dir.path()).build().await.unwrap();

        assert_eq!(pipeline.instances().active_slot(), SlotId::Zero);
        assert_eq!(
            pipeline.layout().identifiers().len(),
            pipeline.registry().list_all().len()
        );
        for source in pipeline.registry().list_all() {
            assert_eq!(
                pipeline.harvest().has_harvester(&source.identifier),
                source.kind == SourceKind::ArchiveUpload
            );
        }
    }

    #[tokio::test]
    async fn test_reader_follows_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder(dir.path()).build().await.unwrap();
        let empty = SourceSelection::empty(&pipeline.registry().snapshot());

        let before = pipeline.reader();
        let run = pipeline
            .process()
            .process(empty, true, true, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(before.slot(), SlotId::Zero);
        assert_eq!(pipeline.reader().slot(), run.target_slot);
        assert_eq!(
            pipeline.content_digest(None).await.unwrap(),
            pipeline.content_digest(Some(before.slot())).await.unwrap()
        );
    }
}
