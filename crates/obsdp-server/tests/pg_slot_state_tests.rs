//! PostgreSQL slot state store tests
//!
//! These tests require Docker to be running. Run with:
//!
//! ```bash
//! cargo test --test pg_slot_state_tests -- --ignored --nocapture
//! ```

mod common;

use anyhow::{Context, Result};
use chrono::Utc;
use common::init_tracing;
use obsdp_common::types::{SlotId, SourceId};
use obsdp_server::pipeline::instance::{
    InstanceManager, InstanceSlot, SlotState, SlotStateStore,
};
use obsdp_server::pipeline::pg::PgSlotStateStore;
use sqlx::postgres::PgPoolOptions;
use std::collections::BTreeSet;
use std::sync::Arc;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    store: Arc<PgSlotStateStore>,
}

async fn start_postgres() -> Result<TestPostgres> {
    let container = Postgres::default()
        .with_tag("16-alpine")
        .start()
        .await
        .context("Failed to start PostgreSQL container")?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432.tcp()).await?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&format!("postgresql://postgres:postgres@{host}:{port}/postgres"))
        .await
        .context("Failed to connect to PostgreSQL")?;

    let store = PgSlotStateStore::new(pool);
    store.migrate().await?;
    Ok(TestPostgres {
        _container: container,
        store: Arc::new(store),
    })
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_slot_state_round_trip() -> Result<()> {
    init_tracing();
    let pg = start_postgres().await?;

    assert!(pg.store.load().await?.is_none());

    let slot = InstanceSlot {
        slot: SlotId::One,
        state: SlotState::ReadyToActivate,
        last_completed_at: Some(Utc::now()),
        selection: BTreeSet::from([SourceId(1), SourceId(7)]),
    };
    pg.store.save_active(SlotId::Zero).await?;
    pg.store.save_slot(&slot).await?;

    let loaded = pg.store.load().await?.context("state was saved")?;
    assert_eq!(loaded.active, SlotId::Zero);
    let restored = loaded
        .slots
        .iter()
        .find(|s| s.slot == SlotId::One)
        .context("slot one persisted")?;
    assert_eq!(restored.state, SlotState::ReadyToActivate);
    assert_eq!(restored.selection, slot.selection);
    assert_eq!(
        restored.last_completed_at.map(|t| t.timestamp_micros()),
        slot.last_completed_at.map(|t| t.timestamp_micros())
    );
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_promotion_survives_restart() -> Result<()> {
    init_tracing();
    let pg = start_postgres().await?;

    let manager = InstanceManager::load(pg.store.clone()).await?;
    assert_eq!(manager.active_slot(), SlotId::Zero);
    pg.store
        .save_slot(&InstanceSlot {
            slot: SlotId::One,
            state: SlotState::ReadyToActivate,
            last_completed_at: Some(Utc::now()),
            selection: BTreeSet::from([SourceId(2)]),
        })
        .await?;

    let manager = InstanceManager::load(pg.store.clone()).await?;
    manager.promote(SlotId::One).await?;

    let reloaded = InstanceManager::load(pg.store.clone()).await?;
    assert_eq!(reloaded.active_slot(), SlotId::One);
    assert_eq!(reloaded.slot_state(SlotId::Zero).await.state, SlotState::Inactive);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_interrupted_run_is_recovered_as_failed() -> Result<()> {
    init_tracing();
    let pg = start_postgres().await?;

    InstanceManager::load(pg.store.clone()).await?;
    pg.store
        .save_slot(&InstanceSlot {
            slot: SlotId::One,
            state: SlotState::Populating,
            last_completed_at: None,
            selection: BTreeSet::from([SourceId(3)]),
        })
        .await?;

    let manager = InstanceManager::load(pg.store.clone()).await?;
    assert_eq!(manager.slot_state(SlotId::One).await.state, SlotState::Failed);

    let persisted = pg.store.load().await?.context("state was saved")?;
    let one = persisted
        .slots
        .iter()
        .find(|s| s.slot == SlotId::One)
        .context("slot one persisted")?;
    assert_eq!(one.state, SlotState::Failed);
    Ok(())
}
