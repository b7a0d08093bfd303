//! Dual-instance publishing
//!
//! Two interchangeable slots hold canonical snapshots. Readers are served from
//! the active slot; processing writes into the other one. The active slot is an
//! index, and promotion is a compare-and-swap on it, so a reader sees either the
//! old snapshot or the new one.
//!
//! Slot states:
//!
//! ```text
//! Inactive | Failed | ReadyToActivate --begin_populating--> Populating
//! Populating --mark_ready--> ReadyToActivate --promote--> Active
//! Populating --mark_failed--> Failed
//! Active --(other slot promoted)--> Inactive
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsdp_common::types::{SlotId, SourceId};
use obsdp_common::{ObsdpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Inactive,
    Populating,
    ReadyToActivate,
    Active,
    Failed,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Inactive => "inactive",
            SlotState::Populating => "populating",
            SlotState::ReadyToActivate => "ready_to_activate",
            SlotState::Active => "active",
            SlotState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(SlotState::Inactive),
            "populating" => Some(SlotState::Populating),
            "ready_to_activate" => Some(SlotState::ReadyToActivate),
            "active" => Some(SlotState::Active),
            "failed" => Some(SlotState::Failed),
            _ => None,
        }
    }
}

/// Durable description of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSlot {
    pub slot: SlotId,
    pub state: SlotState,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Sources of the run that last wrote the slot
    pub selection: BTreeSet<SourceId>,
}

impl InstanceSlot {
    fn fresh(slot: SlotId, active: SlotId) -> Self {
        Self {
            slot,
            state: if slot == active {
                SlotState::Active
            } else {
                SlotState::Inactive
            },
            last_completed_at: None,
            selection: BTreeSet::new(),
        }
    }
}

/// Everything needed to rebuild an [`InstanceManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedInstances {
    pub active: SlotId,
    pub slots: Vec<InstanceSlot>,
}

/// Durable storage for slot states and the active pointer
#[async_trait]
pub trait SlotStateStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedInstances>>;

    async fn save_slot(&self, slot: &InstanceSlot) -> Result<()>;

    async fn save_active(&self, active: SlotId) -> Result<()>;
}

/// Slot state kept in process memory
#[derive(Debug, Default)]
pub struct MemorySlotStateStore {
    state: std::sync::Mutex<Option<PersistedInstances>>,
}

impl MemorySlotStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a previous process's state
    pub fn with_state(state: PersistedInstances) -> Self {
        Self {
            state: std::sync::Mutex::new(Some(state)),
        }
    }

    pub fn persisted(&self) -> Option<PersistedInstances> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl SlotStateStore for MemorySlotStateStore {
    async fn load(&self) -> Result<Option<PersistedInstances>> {
        Ok(self.persisted())
    }

    async fn save_slot(&self, slot: &InstanceSlot) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let persisted = state.get_or_insert_with(|| PersistedInstances {
            active: SlotId::Zero,
            slots: SlotId::ALL
                .iter()
                .map(|s| InstanceSlot::fresh(*s, SlotId::Zero))
                .collect(),
        });
        match persisted.slots.iter_mut().find(|s| s.slot == slot.slot) {
            Some(existing) => *existing = slot.clone(),
            None => persisted.slots.push(slot.clone()),
        }
        Ok(())
    }

    async fn save_active(&self, active: SlotId) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.as_mut() {
            Some(persisted) => persisted.active = active,
            None => {
                *state = Some(PersistedInstances {
                    active,
                    slots: SlotId::ALL
                        .iter()
                        .map(|s| InstanceSlot::fresh(*s, active))
                        .collect(),
                })
            },
        }
        Ok(())
    }
}

/// Owner of the slot pair and the active pointer
pub struct InstanceManager {
    slots: [Mutex<InstanceSlot>; 2],
    active: AtomicU8,
    store: Arc<dyn SlotStateStore>,
}

impl InstanceManager {
    /// Restore slot state from the store
    ///
    /// A slot persisted as `Populating` belonged to a run that never finished; it
    /// comes back as `Failed`.
    pub async fn load(store: Arc<dyn SlotStateStore>) -> Result<Self> {
        let persisted = match store.load().await? {
            Some(persisted) => persisted,
            None => {
                let fresh = PersistedInstances {
                    active: SlotId::Zero,
                    slots: SlotId::ALL
                        .iter()
                        .map(|s| InstanceSlot::fresh(*s, SlotId::Zero))
                        .collect(),
                };
                store.save_active(fresh.active).await?;
                for slot in &fresh.slots {
                    store.save_slot(slot).await?;
                }
                fresh
            },
        };

        let active = persisted.active;
        let mut restored = SlotId::ALL.map(|s| InstanceSlot::fresh(s, active));
        for slot in persisted.slots {
            let idx = slot.slot.index();
            restored[idx] = slot;
        }

        for slot in restored.iter_mut() {
            if slot.slot == active {
                slot.state = SlotState::Active;
            } else if slot.state == SlotState::Active {
                slot.state = SlotState::Inactive;
            }
            if slot.state == SlotState::Populating {
                warn!(slot = %u8::from(slot.slot), "Slot was left populating by an interrupted run, marking failed");
                slot.state = SlotState::Failed;
                store.save_slot(slot).await?;
            }
        }

        info!(active = %u8::from(active), "Instance state loaded");
        let [zero, one] = restored;
        Ok(Self {
            slots: [Mutex::new(zero), Mutex::new(one)],
            active: AtomicU8::new(active.into()),
            store,
        })
    }

    /// Fresh manager over an in-memory store
    pub async fn in_memory() -> Result<Self> {
        Self::load(Arc::new(MemorySlotStateStore::new())).await
    }

    pub fn active_slot(&self) -> SlotId {
        match self.active.load(Ordering::Acquire) {
            0 => SlotId::Zero,
            _ => SlotId::One,
        }
    }

    /// Slot a process run writes into
    pub fn target_slot(&self) -> SlotId {
        self.active_slot().other()
    }

    pub async fn slot_state(&self, slot: SlotId) -> InstanceSlot {
        let mut info = self.slots[slot.index()].lock().await.clone();
        info.state = self.visible_state(slot, info.state);
        info
    }

    pub async fn slots(&self) -> [InstanceSlot; 2] {
        [
            self.slot_state(SlotId::Zero).await,
            self.slot_state(SlotId::One).await,
        ]
    }

    /// Active is derived from the pointer so exactly one slot reports it
    fn visible_state(&self, slot: SlotId, stored: SlotState) -> SlotState {
        if slot == self.active_slot() {
            SlotState::Active
        } else if stored == SlotState::Active {
            SlotState::Inactive
        } else {
            stored
        }
    }

    async fn lock_pair(&self) -> [MutexGuard<'_, InstanceSlot>; 2] {
        let zero = self.slots[0].lock().await;
        let one = self.slots[1].lock().await;
        [zero, one]
    }

    /// Make `slot` the active slot
    ///
    /// Requires the slot to be `ReadyToActivate`; anything else is rejected without
    /// side effects. The previously active slot becomes `Inactive`.
    #[tracing::instrument(skip(self))]
    pub async fn promote(&self, slot: SlotId) -> Result<()> {
        let mut guards = self.lock_pair().await;

        let current = self.active_slot();
        let state = self.visible_state(slot, guards[slot.index()].state);
        if state != SlotState::ReadyToActivate {
            return Err(ObsdpError::invalid_transition(format!(
                "slot {} is {}, only a ready slot can be promoted",
                u8::from(slot),
                state.as_str()
            )));
        }

        self.store.save_active(slot).await?;
        if self
            .active
            .compare_exchange(current.into(), slot.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let actual = self.active_slot();
            self.store.save_active(actual).await?;
            return Err(ObsdpError::invalid_transition(format!(
                "active slot changed during promotion of slot {}",
                u8::from(slot)
            )));
        }

        guards[slot.index()].state = SlotState::Active;
        guards[current.index()].state = SlotState::Inactive;
        for guard in &guards {
            if let Err(err) = self.store.save_slot(guard).await {
                warn!(error = %err, "Failed to persist slot state after promotion");
            }
        }

        info!(previous = %u8::from(current), "Slot promoted");
        Ok(())
    }

    /// Durably move the target slot to `Populating`
    pub(crate) async fn begin_populating(
        &self,
        slot: SlotId,
        selection: &BTreeSet<SourceId>,
    ) -> Result<()> {
        let mut guard = self.slots[slot.index()].lock().await;
        if slot == self.active_slot() {
            return Err(ObsdpError::invalid_transition(format!(
                "slot {} is active and cannot be written",
                u8::from(slot)
            )));
        }
        if guard.state == SlotState::Populating {
            return Err(ObsdpError::invalid_transition(format!(
                "slot {} is already populating",
                u8::from(slot)
            )));
        }

        let mut next = guard.clone();
        next.state = SlotState::Populating;
        next.selection = selection.clone();
        self.store.save_slot(&next).await?;
        *guard = next;
        Ok(())
    }

    pub(crate) async fn mark_ready(&self, slot: SlotId, completed_at: DateTime<Utc>) -> Result<()> {
        self.finish(slot, SlotState::ReadyToActivate, Some(completed_at)).await
    }

    pub(crate) async fn mark_inactive(&self, slot: SlotId) -> Result<()> {
        self.finish(slot, SlotState::Inactive, None).await
    }

    /// Best effort; the in-memory state is updated even if persisting fails
    pub(crate) async fn mark_failed(&self, slot: SlotId) {
        let mut guard = self.slots[slot.index()].lock().await;
        guard.state = SlotState::Failed;
        if let Err(err) = self.store.save_slot(&guard).await {
            warn!(slot = %u8::from(slot), error = %err, "Failed to persist failed slot state");
        }
    }

    async fn finish(
        &self,
        slot: SlotId,
        state: SlotState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut guard = self.slots[slot.index()].lock().await;
        if guard.state != SlotState::Populating {
            return Err(ObsdpError::invalid_transition(format!(
                "slot {} is {}, expected populating",
                u8::from(slot),
                guard.state.as_str()
            )));
        }

        let mut next = guard.clone();
        next.state = state;
        if completed_at.is_some() {
            next.last_completed_at = completed_at;
        }
        self.store.save_slot(&next).await?;
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready_manager() -> (InstanceManager, SlotId) {
        let manager = InstanceManager::in_memory().await.unwrap();
        let target = manager.target_slot();
        manager
            .begin_populating(target, &BTreeSet::from([SourceId(1)]))
            .await
            .unwrap();
        manager.mark_ready(target, Utc::now()).await.unwrap();
        (manager, target)
    }

    #[tokio::test]
    async fn test_fresh_manager() {
        let manager = InstanceManager::in_memory().await.unwrap();
        assert_eq!(manager.active_slot(), SlotId::Zero);
        assert_eq!(manager.target_slot(), SlotId::One);

        let [zero, one] = manager.slots().await;
        assert_eq!(zero.state, SlotState::Active);
        assert_eq!(one.state, SlotState::Inactive);
    }

    #[tokio::test]
    async fn test_promote_swaps_active() {
        let (manager, target) = ready_manager().await;
        manager.promote(target).await.unwrap();

        assert_eq!(manager.active_slot(), target);
        assert_eq!(manager.slot_state(target).await.state, SlotState::Active);
        assert_eq!(
            manager.slot_state(target.other()).await.state,
            SlotState::Inactive
        );
    }

    #[tokio::test]
    async fn test_promote_requires_ready() {
        let manager = InstanceManager::in_memory().await.unwrap();
        let err = manager.promote(SlotId::One).await.unwrap_err();
        assert!(matches!(err, ObsdpError::InvalidTransition(_)));
        // already active
        let err = manager.promote(SlotId::Zero).await.unwrap_err();
        assert!(matches!(err, ObsdpError::InvalidTransition(_)));
        assert_eq!(manager.active_slot(), SlotId::Zero);
    }

    #[tokio::test]
    async fn test_active_slot_cannot_be_populated() {
        let manager = InstanceManager::in_memory().await.unwrap();
        let err = manager
            .begin_populating(SlotId::Zero, &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObsdpError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_populating_is_persisted_before_work() {
        let store = Arc::new(MemorySlotStateStore::new());
        let manager = InstanceManager::load(store.clone()).await.unwrap();
        manager
            .begin_populating(SlotId::One, &BTreeSet::from([SourceId(4)]))
            .await
            .unwrap();

        let persisted = store.persisted().unwrap();
        let one = persisted.slots.iter().find(|s| s.slot == SlotId::One).unwrap();
        assert_eq!(one.state, SlotState::Populating);
        assert!(one.selection.contains(&SourceId(4)));
    }

    #[tokio::test]
    async fn test_load_recovers_interrupted_run() {
        let store = Arc::new(MemorySlotStateStore::new());
        {
            let manager = InstanceManager::load(store.clone()).await.unwrap();
            manager
                .begin_populating(SlotId::One, &BTreeSet::new())
                .await
                .unwrap();
        }

        let manager = InstanceManager::load(store.clone()).await.unwrap();
        assert_eq!(manager.slot_state(SlotId::One).await.state, SlotState::Failed);
        assert_eq!(manager.active_slot(), SlotId::Zero);
    }

    #[tokio::test]
    async fn test_load_restores_promoted_pointer() {
        let store = Arc::new(MemorySlotStateStore::new());
        {
            let manager = InstanceManager::load(store.clone()).await.unwrap();
            manager.begin_populating(SlotId::One, &BTreeSet::new()).await.unwrap();
            manager.mark_ready(SlotId::One, Utc::now()).await.unwrap();
            manager.promote(SlotId::One).await.unwrap();
        }

        let manager = InstanceManager::load(store).await.unwrap();
        assert_eq!(manager.active_slot(), SlotId::One);
        assert_eq!(manager.slot_state(SlotId::Zero).await.state, SlotState::Inactive);
    }

    #[tokio::test]
    async fn test_failed_slot_can_be_retargeted() {
        let manager = InstanceManager::in_memory().await.unwrap();
        manager.begin_populating(SlotId::One, &BTreeSet::new()).await.unwrap();
        manager.mark_failed(SlotId::One).await;
        assert_eq!(manager.slot_state(SlotId::One).await.state, SlotState::Failed);

        manager.begin_populating(SlotId::One, &BTreeSet::new()).await.unwrap();
        assert!(manager.mark_ready(SlotId::One, Utc::now()).await.is_ok());
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            SlotState::Inactive,
            SlotState::Populating,
            SlotState::ReadyToActivate,
            SlotState::Active,
            SlotState::Failed,
        ] {
            assert_eq!(SlotState::parse(state.as_str()), Some(state));
        }
    }
}
