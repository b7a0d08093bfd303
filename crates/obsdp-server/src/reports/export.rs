//! Human-readable JSON rendering of validation reports

use obsdp_common::Result;

use super::types::{ReportArtifact, ReportDocument, ValidationReport};

pub const CONTENT_TYPE: &str = "application/json";

/// File name a report is downloaded as
pub fn artifact_filename(report: &ValidationReport) -> String {
    let name: String = report
        .source_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!(
        "validation-report-{}-{}.json",
        name.trim_matches('-'),
        report.created_at.format("%Y%m%d%H%M%S")
    )
}

/// Render a report document as pretty-printed JSON
pub fn export_json(document: &ReportDocument) -> Result<ReportArtifact> {
    Ok(ReportArtifact {
        bytes: serde_json::to_vec_pretty(document)?,
        content_type: CONTENT_TYPE.to_string(),
        filename: document.report.artifact.filename.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::types::{ArtifactRef, ReportCounts, ReportLimits, SourceRef};
    use chrono::{TimeZone, Utc};
    use obsdp_common::types::{ReportId, SourceId};

    #[test]
    fn test_export_is_readable_json() {
        let report = ValidationReport {
            id: ReportId::generate(),
            created_by: "analyst@example.org".to_string(),
            source_ref: SourceRef::Source {
                source_id: SourceId(12),
            },
            source_name: "Biologg / uploads".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 11, 2, 8, 0, 0).unwrap(),
            limits: ReportLimits {
                max_read: 100,
                max_valid_samples: 5,
                max_invalid_samples: 5,
            },
            counts: ReportCounts::default(),
            artifact: ArtifactRef {
                filename: String::new(),
                content_type: CONTENT_TYPE.to_string(),
            },
        };
        assert_eq!(
            artifact_filename(&report),
            "validation-report-Biologg---uploads-20241102080000.json"
        );

        let document = ReportDocument {
            report,
            valid_samples: Vec::new(),
            invalid_samples: Vec::new(),
        };
        let artifact = export_json(&document).unwrap();
        let text = String::from_utf8(artifact.bytes).unwrap();
        assert!(text.contains("\n  \"report\""));
        assert_eq!(artifact.content_type, "application/json");
    }
}
