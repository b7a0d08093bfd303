//! Shared fixtures for the OBSDP integration tests
//!
//! Everything runs against the in-memory collaborators. [`TestVerbatimStore`]
//! wraps the in-memory verbatim store with a read gate and an injectable failure
//! so tests can hold a process run mid-flight or make it fail upstream.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsdp_common::types::{LocalizedText, SlotId, SourceId};
use obsdp_common::Result;
use obsdp_server::pipeline::harvest::{HarvestContext, HarvestSink, Harvester, StaticHarvester};
use obsdp_server::pipeline::instance::SlotState;
use obsdp_server::pipeline::registry::{Source, SourceKind, SourceRegistry};
use obsdp_server::pipeline::types::VerbatimRecord;
use obsdp_server::pipeline::verbatim::{MemoryVerbatimStore, VerbatimStore};
use obsdp_server::pipeline::Pipeline;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,obsdp_server=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A valid Darwin Core observation
pub fn observation(id: &str) -> VerbatimRecord {
    VerbatimRecord::new(
        id,
        json!({
            "occurrenceID": id,
            "scientificName": "Cyanistes caeruleus",
            "eventDate": "2023-05-14",
            "decimalLatitude": 55.7,
            "decimalLongitude": 13.2,
            "individualCount": 2
        }),
    )
}

/// An observation that fails validation (no taxon, no coordinates)
pub fn broken(id: &str) -> VerbatimRecord {
    VerbatimRecord::new(id, json!({ "occurrenceID": id, "eventDate": "2023-05-14" }))
}

pub fn observations(prefix: &str, n: usize) -> Vec<VerbatimRecord> {
    (0..n).map(|i| observation(&format!("{prefix}-{i}"))).collect()
}

/// Verbatim store with a read gate and an on/off upstream failure
#[derive(Default)]
pub struct TestVerbatimStore {
    inner: MemoryVerbatimStore,
    gate: std::sync::Mutex<Option<Arc<Semaphore>>>,
    fail_reads: AtomicBool,
}

impl TestVerbatimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads wait for a permit on `gate`
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        let store = Self::default();
        store.set_gate(Some(gate));
        store
    }

    /// Gate (or ungate) reads from now on
    pub fn set_gate(&self, gate: Option<Arc<Semaphore>>) {
        *self.gate.lock().unwrap() = gate;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VerbatimStore for TestVerbatimStore {
    async fn begin_generation(&self, source: SourceId) -> Result<()> {
        self.inner.begin_generation(source).await
    }

    async fn append(&self, source: SourceId, batch: Vec<VerbatimRecord>) -> Result<()> {
        self.inner.append(source, batch).await
    }

    async fn commit(&self, source: SourceId) -> Result<usize> {
        self.inner.commit(source).await
    }

    async fn discard(&self, source: SourceId) -> Result<()> {
        self.inner.discard(source).await
    }

    async fn read(&self, source: SourceId, limit: Option<usize>) -> Result<Vec<VerbatimRecord>> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| anyhow::anyhow!("read gate closed: {e}"))?;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("verbatim partition {source} is unreadable").into());
        }
        self.inner.read(source, limit).await
    }

    async fn committed_at(&self, source: SourceId) -> Result<Option<DateTime<Utc>>> {
        self.inner.committed_at(source).await
    }
}

/// Harvester that blocks until its gate gets a permit
pub struct GatedHarvester {
    pub gate: Arc<Semaphore>,
    pub records: Vec<VerbatimRecord>,
}

#[async_trait]
impl Harvester for GatedHarvester {
    async fn harvest(
        &self,
        _ctx: &HarvestContext,
        sink: &HarvestSink,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let _permit = self.gate.acquire().await?;
        sink.write(self.records.clone()).await?;
        Ok(())
    }
}

pub fn api_source(id: i32, identifier: &str) -> Source {
    Source {
        id: SourceId(id),
        identifier: identifier.to_string(),
        kind: SourceKind::ApiPoll,
        include_in_scheduled_harvest: true,
        active_for_processing: true,
        display_name: LocalizedText::same(identifier),
        organization: LocalizedText::default(),
    }
}

/// Registry holding sources A (1), B (2) and C (3)
pub fn abc_registry() -> Arc<SourceRegistry> {
    let registry = SourceRegistry::new();
    for (id, identifier) in [(1, "SourceA"), (2, "SourceB"), (3, "SourceC")] {
        registry
            .register(api_source(id, identifier))
            .expect("register test source");
    }
    Arc::new(registry)
}

pub struct TestPipeline {
    pub pipeline: Arc<Pipeline>,
    pub verbatim: Arc<TestVerbatimStore>,
    pub _dir: tempfile::TempDir,
}

pub async fn pipeline_with(registry: Arc<SourceRegistry>, verbatim: TestVerbatimStore) -> TestPipeline {
    let dir = tempfile::tempdir().expect("temp dir");
    let verbatim = Arc::new(verbatim);
    let pipeline = Pipeline::builder(dir.path())
        .registry(registry)
        .verbatim(verbatim.clone())
        .settle_delay(Duration::ZERO)
        .build()
        .await
        .expect("pipeline builds");
    TestPipeline {
        pipeline: Arc::new(pipeline),
        verbatim,
        _dir: dir,
    }
}

/// Register a static harvester for `identifier` and run it to completion
pub async fn harvest_static(pipeline: &Pipeline, identifier: &str, records: Vec<VerbatimRecord>) {
    let source = pipeline.registry().resolve(identifier).expect("known source");
    pipeline
        .harvest()
        .register_harvester(identifier, Arc::new(StaticHarvester::new(records)));
    pipeline
        .harvest()
        .harvest(source.id, CancellationToken::new())
        .await
        .expect("harvest succeeds");
}

/// Zip holding a Darwin Core core file
pub fn build_dwca(core: &str) -> Vec<u8> {
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("occurrence.txt", SimpleFileOptions::default())
        .expect("start zip entry");
    writer.write_all(core.as_bytes()).expect("write core file");
    writer.finish().expect("finish zip").into_inner()
}

/// Wait until `slot` reaches `state`
pub async fn wait_for_slot(pipeline: &Pipeline, slot: SlotId, state: SlotState) {
    for _ in 0..1_000 {
        if pipeline.instances().slot_state(slot).await.state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("slot {slot} never reached {}", state.as_str());
}

/// Wait until `condition` holds, yielding to other tasks in between
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
