//! Source registry
//!
//! The authoritative list of data sources. Every component looks sources up
//! through [`SourceRegistry::resolve`] (or a [`RegistrySnapshot`] taken from it),
//! which accepts either a numeric id or an identifier.
//!
//! Readers never block writers for long: the registry hands out immutable
//! snapshots and every mutation publishes a new snapshot with a bumped version.

use obsdp_common::types::{LocalizedText, SourceId};
use obsdp_common::{ObsdpError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::reports::store::ReportStore;

/// How a source delivers its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Polled from a vendor API
    ApiPoll,
    /// Darwin Core Archive files uploaded by an operator
    ArchiveUpload,
    /// National registry export
    Registry,
}

/// A configured external provider of observation or checklist data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub identifier: String,
    pub kind: SourceKind,
    pub include_in_scheduled_harvest: bool,
    pub active_for_processing: bool,
    pub display_name: LocalizedText,
    pub organization: LocalizedText,
}

impl Source {
    /// Placeholder used when an uploaded archive names no known source
    pub fn adhoc(label: &str) -> Self {
        Self {
            id: SourceId(0),
            identifier: format!("adhoc:{label}"),
            kind: SourceKind::ArchiveUpload,
            include_in_scheduled_harvest: false,
            active_for_processing: false,
            display_name: LocalizedText::same(label),
            organization: LocalizedText::default(),
        }
    }
}

/// Immutable view of the registry at one version
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    /// Ordered by id
    sources: Vec<Source>,
}

impl RegistrySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn get(&self, id: SourceId) -> Option<&Source> {
        self.sources
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|idx| &self.sources[idx])
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.get(id).is_some()
    }

    /// Look a source up by numeric id or by identifier (case-insensitive)
    pub fn resolve(&self, id_or_identifier: &str) -> Result<&Source> {
        let key = id_or_identifier.trim();
        let found = match key.parse::<i32>() {
            Ok(id) => self.get(SourceId(id)),
            Err(_) => self
                .sources
                .iter()
                .find(|s| s.identifier.eq_ignore_ascii_case(key)),
        };
        found.ok_or_else(|| ObsdpError::not_found(format!("source '{key}'")))
    }

    pub fn active_for_processing(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|s| s.active_for_processing)
    }

    pub fn scheduled_for_harvest(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|s| s.include_in_scheduled_harvest)
    }

    fn with_change(&self, change: impl FnOnce(&mut Vec<Source>)) -> Self {
        let mut sources = self.sources.clone();
        change(&mut sources);
        sources.sort_by_key(|s| s.id);
        Self {
            version: self.version + 1,
            sources,
        }
    }
}

/// Outcome of a seeding call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSummary {
    pub inserted: usize,
    pub overwritten: usize,
    pub unchanged: usize,
}

impl SeedSummary {
    /// Number of sources written by this call
    pub fn written(&self) -> usize {
        self.inserted + self.overwritten
    }
}

/// Authoritative list of data sources
#[derive(Debug, Default)]
pub struct SourceRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    /// Shared by writers of data that names a source, exclusive in `remove`
    references: tokio::sync::RwLock<()>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-seeded with the default sources
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.publish(|_| RegistrySnapshot {
            version: 1,
            sources: default_sources(),
        });
        registry
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    pub fn resolve(&self, id_or_identifier: &str) -> Result<Source> {
        self.snapshot().resolve(id_or_identifier).cloned()
    }

    pub fn get(&self, id: SourceId) -> Result<Source> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| ObsdpError::not_found(format!("source {id}")))
    }

    pub fn list_all(&self) -> Vec<Source> {
        self.snapshot().sources.clone()
    }

    /// Seed the default source list
    ///
    /// Existing sources are left alone unless `overwrite_if_exists` is set, so a
    /// repeated call is a no-op that reports what is already there.
    pub fn seed_defaults(&self, overwrite_if_exists: bool) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();

        self.publish(|current| {
            let mut next = current.clone();
            let mut changed = false;
            for source in default_sources() {
                match next.sources.iter_mut().find(|s| s.id == source.id) {
                    Some(existing) if overwrite_if_exists => {
                        *existing = source;
                        summary.overwritten += 1;
                        changed = true;
                    },
                    Some(_) => summary.unchanged += 1,
                    None => {
                        next.sources.push(source);
                        summary.inserted += 1;
                        changed = true;
                    },
                }
            }
            if changed {
                next.with_change(|_| {})
            } else {
                next
            }
        });

        info!(
            inserted = summary.inserted,
            overwritten = summary.overwritten,
            unchanged = summary.unchanged,
            "Seeded default sources"
        );
        Ok(summary)
    }

    /// Seed (or re-seed) one default source by id or identifier
    pub fn seed_one(&self, id_or_identifier: &str) -> Result<Source> {
        let defaults = RegistrySnapshot {
            version: 0,
            sources: default_sources(),
        };
        let source = defaults.resolve(id_or_identifier)?.clone();

        let seeded = source.clone();
        self.publish(move |current| {
            current.with_change(|sources| {
                sources.retain(|s| s.id != seeded.id);
                sources.push(seeded);
            })
        });

        debug!(source_id = %source.id, identifier = %source.identifier, "Seeded source");
        Ok(source)
    }

    /// Register a source that is not part of the default list
    pub fn register(&self, source: Source) -> Result<Source> {
        if source.id.0 <= 0 {
            return Err(ObsdpError::invalid_argument("source id must be positive"));
        }
        if source.identifier.trim().is_empty() || source.identifier.parse::<i32>().is_ok() {
            return Err(ObsdpError::invalid_argument(
                "source identifier must be non-empty and not numeric",
            ));
        }

        let mut conflict = None;
        let registered = source.clone();
        self.publish(|current| {
            if let Some(existing) = current.sources.iter().find(|s| {
                s.id == registered.id || s.identifier.eq_ignore_ascii_case(&registered.identifier)
            }) {
                conflict = Some(existing.identifier.clone());
                return current.clone();
            }
            current.with_change(|sources| sources.push(registered))
        });

        match conflict {
            Some(existing) => Err(ObsdpError::invalid_argument(format!(
                "source {} conflicts with registered source '{existing}'",
                source.id
            ))),
            None => Ok(source),
        }
    }

    /// Change the harvest/processing flags of a source
    pub fn set_flags(
        &self,
        id: SourceId,
        include_in_scheduled_harvest: bool,
        active_for_processing: bool,
    ) -> Result<Source> {
        let mut updated = None;
        self.publish(|current| {
            if !current.contains(id) {
                return current.clone();
            }
            current.with_change(|sources| {
                for source in sources.iter_mut().filter(|s| s.id == id) {
                    source.include_in_scheduled_harvest = include_in_scheduled_harvest;
                    source.active_for_processing = active_for_processing;
                    updated = Some(source.clone());
                }
            })
        });
        updated.ok_or_else(|| ObsdpError::not_found(format!("source {id}")))
    }

    /// Hold while storing data that names a source; `remove` waits for it
    pub async fn hold_references(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.references.read().await
    }

    /// Remove a source no stored report refers to
    ///
    /// The reference check and the removal happen under the exclusive side of
    /// the reference lock, so no report naming the source can land in between.
    pub async fn remove(&self, id: SourceId, reports: &dyn ReportStore) -> Result<Source> {
        let _exclusive = self.references.write().await;
        self.get(id)?;
        if reports.references_source(id).await? {
            return Err(ObsdpError::invalid_argument(format!(
                "source {id} is referenced by validation reports"
            )));
        }

        let mut removed = None;
        self.publish(|current| match current.get(id) {
            Some(source) => {
                removed = Some(source.clone());
                current.with_change(|sources| sources.retain(|s| s.id != id))
            },
            None => current.clone(),
        });
        let source = removed.ok_or_else(|| ObsdpError::not_found(format!("source {id}")))?;
        info!(source_id = %id, "Removed source");
        Ok(source)
    }

    fn publish(&self, next: impl FnOnce(&RegistrySnapshot) -> RegistrySnapshot) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = next(&guard);
        *guard = Arc::new(snapshot);
    }
}

fn source(
    id: i32,
    identifier: &str,
    kind: SourceKind,
    active_for_processing: bool,
    display_name: LocalizedText,
    organization: LocalizedText,
) -> Source {
    Source {
        id: SourceId(id),
        identifier: identifier.to_string(),
        kind,
        include_in_scheduled_harvest: kind != SourceKind::ArchiveUpload,
        active_for_processing,
        display_name,
        organization,
    }
}

/// The sources every deployment starts with
pub fn default_sources() -> Vec<Source> {
    use SourceKind::*;

    let artdatabanken = LocalizedText::new("SLU Artdatabanken", "SLU Swedish Species Information Centre");
    let slu_aqua = LocalizedText::same("SLU Aqua");

    vec![
        source(1, "Artportalen", ApiPoll, true, LocalizedText::same("Artportalen"), artdatabanken.clone()),
        source(2, "ClamPortal", ApiPoll, true, LocalizedText::new("Musselportalen", "Clam portal"), artdatabanken.clone()),
        source(3, "Kul", ApiPoll, true, LocalizedText::new("Kustfiskdatabasen", "Coastal fish database"), slu_aqua.clone()),
        source(4, "Mvm", ApiPoll, true, LocalizedText::new("Miljödata MVM", "Environmental data MVM"), LocalizedText::same("SLU")),
        source(5, "Nors", ApiPoll, true, LocalizedText::new("Sjöprovfiskeregistret", "Survey test-fishing register"), slu_aqua.clone()),
        source(6, "Sers", ApiPoll, true, LocalizedText::new("Svenskt elfiskeregister", "Swedish electrofishing register"), slu_aqua.clone()),
        source(7, "Shark", ApiPoll, true, LocalizedText::same("SHARK"), LocalizedText::same("SMHI")),
        source(8, "VirtualHerbarium", ApiPoll, true, LocalizedText::new("Virtuella herbariet", "Virtual herbarium"), LocalizedText::new("Umeå universitet", "Umeå University")),
        source(9, "ObservationDatabase", Registry, true, LocalizedText::new("Observationsdatabasen", "Observation database"), artdatabanken.clone()),
        source(10, "FishData", ApiPoll, true, LocalizedText::new("Fiskdata", "Fish data"), slu_aqua),
        source(11, "iNaturalist", ArchiveUpload, true, LocalizedText::same("iNaturalist"), LocalizedText::same("GBIF Sweden")),
        source(12, "Biologg", ArchiveUpload, true, LocalizedText::same("Biologg"), LocalizedText::same("Biologg")),
        source(13, "DwcArchive", ArchiveUpload, false, LocalizedText::new("Darwin Core-arkiv", "Darwin Core archive"), LocalizedText::default()),
        source(14, "SpeciesChecklists", Registry, true, LocalizedText::new("Artlistor", "Species checklists"), artdatabanken),
        source(15, "BirdSurvey", ApiPoll, true, LocalizedText::new("Svensk fågeltaxering", "Swedish Bird Survey"), LocalizedText::new("Lunds universitet", "Lund University")),
    ]
}
