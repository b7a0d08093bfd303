//! Validation report model

use chrono::{DateTime, Utc};
use obsdp_common::types::{ReportId, SourceId};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::{CanonicalRecord, ValidationIssue, VerbatimRecord};

/// What a report was generated from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    /// Committed verbatim records of a registered source
    Source { source_id: SourceId },
    /// An uploaded archive, with the registered source it named if any
    Upload {
        handle: String,
        source_id: Option<SourceId>,
    },
}

impl SourceRef {
    /// Registered source the report is about
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            SourceRef::Source { source_id } => Some(*source_id),
            SourceRef::Upload { source_id, .. } => *source_id,
        }
    }
}

/// Sampling limits a report was generated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLimits {
    pub max_read: usize,
    pub max_valid_samples: usize,
    pub max_invalid_samples: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounts {
    pub read: usize,
    pub valid_total: usize,
    pub invalid_total: usize,
    pub sampled_valid: usize,
    pub sampled_invalid: usize,
}

/// Where the rendered report lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub id: ReportId,
    pub created_by: String,
    pub source_ref: SourceRef,
    /// Display name of the validated source at generation time
    pub source_name: String,
    pub created_at: DateTime<Utc>,
    pub limits: ReportLimits,
    pub counts: ReportCounts,
    pub artifact: ArtifactRef,
}

/// A record that failed validation, kept verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidSample {
    pub record: VerbatimRecord,
    pub issues: Vec<ValidationIssue>,
}

/// Full content of a report, rendered into its artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub report: ValidationReport,
    pub valid_samples: Vec<CanonicalRecord>,
    pub invalid_samples: Vec<InvalidSample>,
}

/// Rendered report file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
}
