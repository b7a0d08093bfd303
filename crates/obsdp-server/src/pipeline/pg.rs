//! PostgreSQL slot state store

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsdp_common::types::{SlotId, SourceId};
use obsdp_common::Result;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;

use super::instance::{InstanceSlot, PersistedInstances, SlotState, SlotStateStore};

pub struct PgSlotStateStore {
    pool: PgPool,
}

impl PgSlotStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the workspace migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }
}

#[async_trait]
impl SlotStateStore for PgSlotStateStore {
    async fn load(&self) -> Result<Option<PersistedInstances>> {
        let pointer = sqlx::query("SELECT active_slot FROM instance_pointer WHERE id")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load active slot")?;
        let Some(pointer) = pointer else {
            return Ok(None);
        };
        let active: i16 = pointer.try_get("active_slot").context("Malformed active slot")?;
        let active = SlotId::try_from(i64::from(active))?;

        let rows = sqlx::query(
            r#"
            SELECT slot, state, last_completed_at, selection
            FROM instance_slots
            ORDER BY slot
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load slot states")?;

        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            let slot: i16 = row.try_get("slot").context("Malformed slot row")?;
            let state: String = row.try_get("state").context("Malformed slot row")?;
            let last_completed_at: Option<DateTime<Utc>> =
                row.try_get("last_completed_at").context("Malformed slot row")?;
            let selection: Json<BTreeSet<SourceId>> =
                row.try_get("selection").context("Malformed slot row")?;

            slots.push(InstanceSlot {
                slot: SlotId::try_from(i64::from(slot))?,
                state: SlotState::parse(&state)
                    .with_context(|| format!("Unknown slot state '{state}'"))?,
                last_completed_at,
                selection: selection.0,
            });
        }

        Ok(Some(PersistedInstances { active, slots }))
    }

    async fn save_slot(&self, slot: &InstanceSlot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instance_slots (slot, state, last_completed_at, selection, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (slot) DO UPDATE SET
                state = excluded.state,
                last_completed_at = excluded.last_completed_at,
                selection = excluded.selection,
                updated_at = NOW()
            "#,
        )
        .bind(i16::from(u8::from(slot.slot)))
        .bind(slot.state.as_str())
        .bind(slot.last_completed_at)
        .bind(Json(&slot.selection))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save state of slot {}", slot.slot))?;
        Ok(())
    }

    async fn save_active(&self, active: SlotId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instance_pointer (id, active_slot, updated_at)
            VALUES (TRUE, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET
                active_slot = excluded.active_slot,
                updated_at = NOW()
            "#,
        )
        .bind(i16::from(u8::from(active)))
        .execute(&self.pool)
        .await
        .context("Failed to save active slot")?;
        Ok(())
    }
}
