use mediator::Request;
use obsdp_common::ObsdpError;
use serde::{Deserialize, Serialize};

use crate::features::FeatureState;
use crate::pipeline::archive::UploadedArchive;
use crate::pipeline::registry::SourceKind;

/// Store an uploaded Darwin Core Archive
///
/// With a `source` the archive feeds that source's next harvest; without one it
/// can only be used for a validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadArchiveCommand {
    pub file_name: String,
    #[serde(skip_serializing)]
    pub bytes: Vec<u8>,
    pub source: Option<String>,
}

impl Request<Result<UploadedArchive, ObsdpError>> for UploadArchiveCommand {}

impl UploadArchiveCommand {
    pub fn validate(&self) -> Result<(), ObsdpError> {
        if self.bytes.is_empty() {
            return Err(ObsdpError::invalid_argument("uploaded archive is empty"));
        }
        Ok(())
    }
}

#[tracing::instrument(skip(state, command), fields(file_name = %command.file_name, source = ?command.source))]
pub async fn handle(
    state: FeatureState,
    command: UploadArchiveCommand,
) -> Result<UploadedArchive, ObsdpError> {
    command.validate()?;

    let source_id = match command.source.as_deref() {
        Some(source) => {
            let source = state.pipeline.registry().resolve(source)?;
            if source.kind != SourceKind::ArchiveUpload {
                return Err(ObsdpError::invalid_argument(format!(
                    "source '{}' does not take archive uploads",
                    source.identifier
                )));
            }
            Some(source.id)
        },
        None => None,
    };

    state
        .pipeline
        .inbox()
        .persist(&command.file_name, &command.bytes, source_id)
        .await
}
