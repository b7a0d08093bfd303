//! Validation reports
//!
//! A report reads a bounded number of records from a source (or an uploaded
//! archive), classifies each one against the canonical constraints, and keeps
//! aggregate counts plus a capped sample of valid and invalid records.

use chrono::Utc;
use obsdp_common::types::ReportId;
use obsdp_common::{ObsdpError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::export::{artifact_filename, export_json, CONTENT_TYPE};
use super::store::ReportStore;
use super::types::{
    ArtifactRef, InvalidSample, ReportCounts, ReportDocument, ReportLimits, SourceRef,
    ValidationReport,
};
use crate::pipeline::archive::ArchiveInbox;
use crate::pipeline::dwca::ArchiveParser;
use crate::pipeline::normalize::{classify, Normalizer};
use crate::pipeline::registry::{Source, SourceRegistry};
use crate::pipeline::types::VerbatimRecord;
use crate::pipeline::verbatim::VerbatimStore;

/// Precondition applied to sampling limits before a report is generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleGuard {
    /// Reject when `max_read < 2 * max_invalid_samples`
    #[default]
    Legacy,
    /// Reject when `max_read < max_valid_samples + max_invalid_samples`
    Sum,
}

impl SampleGuard {
    fn rejects(self, params: &ValidationParams) -> bool {
        match self {
            SampleGuard::Legacy => {
                params.max_read < params.max_invalid_samples.saturating_mul(2)
            },
            SampleGuard::Sum => {
                params.max_read
                    < params
                        .max_valid_samples
                        .saturating_add(params.max_invalid_samples)
            },
        }
    }

    /// Check the limits; logs when the two rules would decide differently
    pub fn check(self, params: &ValidationParams) -> Result<()> {
        let legacy = SampleGuard::Legacy.rejects(params);
        let sum = SampleGuard::Sum.rejects(params);
        if legacy != sum {
            warn!(
                guard = ?self,
                max_read = params.max_read,
                max_valid_samples = params.max_valid_samples,
                max_invalid_samples = params.max_invalid_samples,
                legacy_rejects = legacy,
                sum_rejects = sum,
                "Sample guard rules disagree"
            );
        }

        if self.rejects(params) {
            return Err(ObsdpError::invalid_argument(format!(
                "max_read {} is too small for {} valid and {} invalid samples",
                params.max_read, params.max_valid_samples, params.max_invalid_samples
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for SampleGuard {
    type Err = ObsdpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(SampleGuard::Legacy),
            "sum" => Ok(SampleGuard::Sum),
            other => Err(ObsdpError::invalid_argument(format!(
                "unknown sample guard '{other}', expected 'legacy' or 'sum'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationParams {
    pub max_read: usize,
    pub max_valid_samples: usize,
    pub max_invalid_samples: usize,
    pub created_by: String,
}

impl ValidationParams {
    fn limits(&self) -> ReportLimits {
        ReportLimits {
            max_read: self.max_read,
            max_valid_samples: self.max_valid_samples,
            max_invalid_samples: self.max_invalid_samples,
        }
    }
}

pub struct ValidationReportGenerator {
    registry: Arc<SourceRegistry>,
    verbatim: Arc<dyn VerbatimStore>,
    inbox: Arc<ArchiveInbox>,
    parser: Arc<dyn ArchiveParser>,
    normalizer: Arc<dyn Normalizer>,
    store: Arc<dyn ReportStore>,
    guard: SampleGuard,
}

impl ValidationReportGenerator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        verbatim: Arc<dyn VerbatimStore>,
        inbox: Arc<ArchiveInbox>,
        parser: Arc<dyn ArchiveParser>,
        normalizer: Arc<dyn Normalizer>,
        store: Arc<dyn ReportStore>,
    ) -> Self {
        Self {
            registry,
            verbatim,
            inbox,
            parser,
            normalizer,
            store,
            guard: SampleGuard::default(),
        }
    }

    pub fn with_guard(mut self, guard: SampleGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn guard(&self) -> SampleGuard {
        self.guard
    }

    /// Report on the committed verbatim records of a registered source
    #[tracing::instrument(skip(self, params), fields(max_read = params.max_read))]
    pub async fn run_for_source(
        &self,
        id_or_identifier: &str,
        params: ValidationParams,
    ) -> Result<ValidationReport> {
        self.guard.check(&params)?;
        let source = self.registry.resolve(id_or_identifier)?;

        let records = self.verbatim.read(source.id, Some(params.max_read)).await?;
        let source_ref = SourceRef::Source {
            source_id: source.id,
        };
        self.generate(&source, source_ref, records, params).await
    }

    /// Report on an uploaded archive
    ///
    /// A source named inside the archive is resolved through the registry; an
    /// archive naming no known source is validated under an ad-hoc source.
    #[tracing::instrument(skip(self, params), fields(max_read = params.max_read))]
    pub async fn run_for_uploaded_archive(
        &self,
        handle: &str,
        params: ValidationParams,
    ) -> Result<ValidationReport> {
        self.guard.check(&params)?;
        let archive = self.inbox.get(handle).await?;

        let bytes = self.inbox.read(handle).await?;
        let parsed = self
            .parser
            .parse(&archive, bytes)
            .await
            .map_err(ObsdpError::from_collaborator)?;

        let named = parsed
            .source_hint
            .as_deref()
            .and_then(|hint| self.registry.resolve(hint).ok());
        let source = match (named, archive.source_id) {
            (Some(source), _) => source,
            (None, Some(id)) => self.registry.get(id)?,
            (None, None) => {
                let stem = Path::new(&archive.handle)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(&archive.handle);
                Source::adhoc(stem)
            },
        };

        let source_ref = SourceRef::Upload {
            handle: archive.handle.clone(),
            source_id: (source.id.0 > 0).then_some(source.id),
        };
        let mut records = parsed.records;
        records.truncate(params.max_read);
        self.generate(&source, source_ref, records, params).await
    }

    async fn generate(
        &self,
        source: &Source,
        source_ref: SourceRef,
        records: Vec<VerbatimRecord>,
        params: ValidationParams,
    ) -> Result<ValidationReport> {
        let mut counts = ReportCounts::default();
        let mut valid_samples = Vec::new();
        let mut invalid_samples = Vec::new();

        for record in records.into_iter().take(params.max_read) {
            counts.read += 1;
            match classify(self.normalizer.as_ref(), source, &record) {
                Ok(canonical) => {
                    counts.valid_total += 1;
                    if valid_samples.len() < params.max_valid_samples {
                        valid_samples.push(canonical);
                    }
                },
                Err(issues) => {
                    counts.invalid_total += 1;
                    if invalid_samples.len() < params.max_invalid_samples {
                        invalid_samples.push(InvalidSample { record, issues });
                    }
                },
            }
        }
        counts.sampled_valid = valid_samples.len();
        counts.sampled_invalid = invalid_samples.len();

        let mut report = ValidationReport {
            id: ReportId::generate(),
            created_by: params.created_by.clone(),
            source_ref,
            source_name: source.display_name.en.clone(),
            created_at: Utc::now(),
            limits: params.limits(),
            counts,
            artifact: ArtifactRef {
                filename: String::new(),
                content_type: CONTENT_TYPE.to_string(),
            },
        };
        report.artifact.filename = artifact_filename(&report);

        let document = ReportDocument {
            report: report.clone(),
            valid_samples,
            invalid_samples,
        };
        let artifact = export_json(&document)?;

        let _references = self.registry.hold_references().await;
        if let Some(source_id) = report.source_ref.source_id() {
            self.registry.get(source_id)?;
        }
        self.store.put(report.clone(), artifact).await?;

        info!(
            report_id = %report.id,
            read = counts.read,
            valid = counts.valid_total,
            invalid = counts.invalid_total,
            "Validation report created"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_read: usize, max_valid: usize, max_invalid: usize) -> ValidationParams {
        ValidationParams {
            max_read,
            max_valid_samples: max_valid,
            max_invalid_samples: max_invalid,
            created_by: "tester".to_string(),
        }
    }

    #[test]
    fn test_legacy_guard() {
        assert!(SampleGuard::Legacy.check(&params(100, 10, 90)).is_err());
        assert!(SampleGuard::Legacy.check(&params(100, 90, 50)).is_ok());
        assert!(SampleGuard::Legacy.check(&params(99, 0, 50)).is_err());
    }

    #[test]
    fn test_sum_guard() {
        assert!(SampleGuard::Sum.check(&params(100, 10, 90)).is_ok());
        assert!(SampleGuard::Sum.check(&params(100, 90, 50)).is_err());
        assert!(SampleGuard::Sum.check(&params(usize::MAX, usize::MAX, 1)).is_err());
    }

    #[test]
    fn test_guard_from_str() {
        assert_eq!("SUM".parse::<SampleGuard>().unwrap(), SampleGuard::Sum);
        assert_eq!(" legacy ".parse::<SampleGuard>().unwrap(), SampleGuard::Legacy);
        assert!("strict".parse::<SampleGuard>().is_err());
    }
}
