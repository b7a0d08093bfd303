//! Core types shared by the harvest and process phases

use chrono::{DateTime, NaiveDate, Utc};
use obsdp_common::types::{SlotId, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::selection::SourceSelection;

/// Raw record exactly as a harvester produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerbatimRecord {
    /// Identifier within the source, stable across harvests
    pub record_id: String,
    /// Source payload, unmodified in structure
    pub payload: serde_json::Value,
}

impl VerbatimRecord {
    pub fn new(record_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            record_id: record_id.into(),
            payload,
        }
    }
}

/// Observation in the canonical model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub source_id: SourceId,
    pub occurrence_id: String,
    pub scientific_name: Option<String>,
    pub event_date: Option<NaiveDate>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub individual_count: Option<u32>,
    /// Remaining source terms; ordered so serialization is deterministic
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// A canonical constraint a record failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl CanonicalRecord {
    /// Check the record against the canonical schema's constraints
    pub fn issues(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.occurrence_id.trim().is_empty() {
            issues.push(ValidationIssue::new("occurrence_id", "missing occurrence id"));
        }
        if self
            .scientific_name
            .as_deref()
            .map_or(true, |name| name.trim().is_empty())
        {
            issues.push(ValidationIssue::new("scientific_name", "missing taxon"));
        }
        if self.event_date.is_none() {
            issues.push(ValidationIssue::new("event_date", "missing or unparseable event date"));
        }
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) {
                    issues.push(ValidationIssue::new("latitude", format!("{lat} out of range")));
                }
                if !(-180.0..=180.0).contains(&lon) {
                    issues.push(ValidationIssue::new("longitude", format!("{lon} out of range")));
                }
            },
            (None, None) => {
                issues.push(ValidationIssue::new("coordinates", "missing coordinates"));
            },
            _ => {
                issues.push(ValidationIssue::new("coordinates", "only one of latitude/longitude set"));
            },
        }

        issues
    }

    pub fn is_valid(&self) -> bool {
        self.issues().is_empty()
    }
}

/// Terminal state of a harvest or process run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// One harvest of one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestRun {
    pub source_id: SourceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub record_count: usize,
    pub error: Option<String>,
}

/// Per-source counters of a process run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProcessStats {
    pub read: usize,
    pub published: usize,
    pub rejected: usize,
}

/// One process run into one slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRun {
    pub selection: SourceSelection,
    pub target_slot: SlotId,
    pub clean_start: bool,
    pub promote_on_success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub promoted: bool,
    pub per_source: BTreeMap<SourceId, SourceProcessStats>,
    pub error: Option<String>,
}

impl ProcessRun {
    pub fn published(&self) -> usize {
        self.per_source.values().map(|s| s.published).sum()
    }
}
