//! Source selection
//!
//! Requests name sources with a bitmask over a deployment-configured, ordered
//! list of source identifiers. The mask is decoded exactly once, at the boundary,
//! into a [`SourceSelection`]; nothing past the boundary sees the raw integer.

use obsdp_common::types::SourceId;
use obsdp_common::{ObsdpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::registry::RegistrySnapshot;

/// Bit position -> source identifier mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionLayout {
    identifiers: Vec<String>,
}

impl SelectionLayout {
    pub const MAX_BITS: usize = u64::BITS as usize;

    pub fn new(identifiers: Vec<String>) -> Result<Self> {
        if identifiers.len() > Self::MAX_BITS {
            return Err(ObsdpError::invalid_argument(format!(
                "selection layout has {} entries, at most {} fit in a mask",
                identifiers.len(),
                Self::MAX_BITS
            )));
        }
        let mut seen = BTreeSet::new();
        for identifier in &identifiers {
            if !seen.insert(identifier.to_ascii_lowercase()) {
                return Err(ObsdpError::invalid_argument(format!(
                    "selection layout lists '{identifier}' twice"
                )));
            }
        }
        Ok(Self { identifiers })
    }

    /// Parse a comma separated identifier list
    pub fn parse(list: &str) -> Result<Self> {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Layout following the registry's id order
    pub fn from_registry(snapshot: &RegistrySnapshot) -> Result<Self> {
        Self::new(snapshot.sources().iter().map(|s| s.identifier.clone()).collect())
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// Decode a mask against the live registry
    ///
    /// A bit beyond the layout is an invalid argument; a bit whose identifier is no
    /// longer registered is reported as not found rather than silently dropped.
    pub fn decode(&self, mask: u64, snapshot: &RegistrySnapshot) -> Result<SourceSelection> {
        let mut ids = BTreeSet::new();

        for bit in 0..Self::MAX_BITS {
            if mask & (1u64 << bit) == 0 {
                continue;
            }
            let identifier = self.identifiers.get(bit).ok_or_else(|| {
                ObsdpError::invalid_argument(format!(
                    "bit {bit} of source mask {mask} has no configured source"
                ))
            })?;
            let source = snapshot.resolve(identifier).map_err(|_| {
                ObsdpError::not_found(format!(
                    "bit {bit} refers to source '{identifier}' which is not registered"
                ))
            })?;
            ids.insert(source.id);
        }

        Ok(SourceSelection {
            ids,
            registry_version: snapshot.version(),
        })
    }

    /// Decode a mask that arrived as a signed integer
    pub fn decode_signed(&self, mask: i64, snapshot: &RegistrySnapshot) -> Result<SourceSelection> {
        let mask = u64::try_from(mask)
            .map_err(|_| ObsdpError::invalid_argument(format!("source mask {mask} is negative")))?;
        self.decode(mask, snapshot)
    }

    /// Encode a selection back into a mask; sources outside the layout are an error
    pub fn encode(&self, selection: &SourceSelection, snapshot: &RegistrySnapshot) -> Result<u64> {
        let mut mask = 0u64;
        for id in selection.ids() {
            let source = snapshot
                .get(*id)
                .ok_or_else(|| ObsdpError::not_found(format!("source {id}")))?;
            let bit = self
                .identifiers
                .iter()
                .position(|i| i.eq_ignore_ascii_case(&source.identifier))
                .ok_or_else(|| {
                    ObsdpError::invalid_argument(format!(
                        "source '{}' has no bit in the selection layout",
                        source.identifier
                    ))
                })?;
            mask |= 1u64 << bit;
        }
        Ok(mask)
    }
}

/// Immutable set of sources participating in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSelection {
    ids: BTreeSet<SourceId>,
    /// Registry version the selection was validated against
    registry_version: u64,
}

impl SourceSelection {
    /// Every source flagged active for processing
    pub fn all_active(snapshot: &RegistrySnapshot) -> Self {
        Self {
            ids: snapshot.active_for_processing().map(|s| s.id).collect(),
            registry_version: snapshot.version(),
        }
    }

    pub fn empty(snapshot: &RegistrySnapshot) -> Self {
        Self {
            ids: BTreeSet::new(),
            registry_version: snapshot.version(),
        }
    }

    /// Selection from explicit ids, all of which must be registered
    pub fn from_ids(
        ids: impl IntoIterator<Item = SourceId>,
        snapshot: &RegistrySnapshot,
    ) -> Result<Self> {
        let ids: BTreeSet<SourceId> = ids.into_iter().collect();
        if let Some(missing) = ids.iter().find(|id| !snapshot.contains(**id)) {
            return Err(ObsdpError::not_found(format!("source {missing}")));
        }
        Ok(Self {
            ids,
            registry_version: snapshot.version(),
        })
    }

    pub fn ids(&self) -> &BTreeSet<SourceId> {
        &self.ids
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn registry_version(&self) -> u64 {
        self.registry_version
    }

    /// Re-check the selection against a later registry snapshot
    pub fn revalidate(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if snapshot.version() == self.registry_version {
            return Ok(());
        }
        match self.ids.iter().find(|id| !snapshot.contains(**id)) {
            Some(removed) => Err(ObsdpError::not_found(format!(
                "source {removed} was removed after the selection was made"
            ))),
            None => Ok(()),
        }
    }
}
