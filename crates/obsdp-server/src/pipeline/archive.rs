//! Uploaded archive inbox
//!
//! Operators upload Darwin Core Archives either for a registered archive-upload
//! source (picked up by that source's next harvest) or for a one-off validation
//! report. Files land in the upload directory as `<stem>_<yyyyMMddHHmmss>.zip`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use obsdp_common::digest::sha256_hex;
use obsdp_common::types::SourceId;
use obsdp_common::{ObsdpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

const ARCHIVE_EXTENSION: &str = "zip";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A persisted upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedArchive {
    /// Stored file name, also the handle used to refer to the upload
    pub handle: String,
    pub path: PathBuf,
    pub source_id: Option<SourceId>,
    pub size: u64,
    /// Hex SHA-256 of the stored bytes
    pub sha256: String,
    /// When the archive was fully written
    pub received_at: DateTime<Utc>,
}

/// Storage name for an upload received at `now`
pub fn stored_name(file_name: &str, now: DateTime<Utc>) -> Result<String> {
    let path = Path::new(file_name);
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ObsdpError::invalid_argument(format!("'{file_name}' is not a file name")))?;

    let is_zip = Path::new(base)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ARCHIVE_EXTENSION));
    if !is_zip {
        return Err(ObsdpError::invalid_argument(format!(
            "'{base}' is not a .zip archive"
        )));
    }

    let stem = Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ObsdpError::invalid_argument(format!("'{base}' has no file stem")))?;

    Ok(format!("{stem}_{}.{ARCHIVE_EXTENSION}", now.format(TIMESTAMP_FORMAT)))
}

/// Upload directory plus the bookkeeping of what arrived when
pub struct ArchiveInbox {
    dir: PathBuf,
    by_handle: RwLock<HashMap<String, UploadedArchive>>,
    latest_by_source: RwLock<HashMap<SourceId, String>>,
}

impl ArchiveInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            by_handle: RwLock::new(HashMap::new()),
            latest_by_source: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an uploaded archive
    ///
    /// Only `.zip` files are accepted. A file already present at the target path
    /// is deleted before the new one is written.
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn persist(
        &self,
        file_name: &str,
        bytes: &[u8],
        source_id: Option<SourceId>,
    ) -> Result<UploadedArchive> {
        let handle = stored_name(file_name, Utc::now())?;
        let path = self.dir.join(&handle);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create upload directory {}", self.dir.display()))?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Replacing existing upload");
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to delete existing upload {}", path.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write upload {}", path.display()))?;

        let archive = UploadedArchive {
            handle: handle.clone(),
            path,
            source_id,
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
            received_at: Utc::now(),
        };

        self.by_handle
            .write()
            .await
            .insert(handle.clone(), archive.clone());
        if let Some(id) = source_id {
            self.latest_by_source.write().await.insert(id, handle);
        }

        info!(handle = %archive.handle, source_id = ?source_id, sha256 = %archive.sha256, "Archive received");
        Ok(archive)
    }

    pub async fn get(&self, handle: &str) -> Result<UploadedArchive> {
        self.by_handle
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| ObsdpError::not_found(format!("uploaded archive '{handle}'")))
    }

    /// Most recent upload for an archive-upload source
    pub async fn latest_for_source(&self, source_id: SourceId) -> Option<UploadedArchive> {
        let handle = self.latest_by_source.read().await.get(&source_id).cloned()?;
        self.by_handle.read().await.get(&handle).cloned()
    }

    /// Raw bytes of an upload
    pub async fn read(&self, handle: &str) -> Result<Vec<u8>> {
        let archive = self.get(handle).await?;
        let bytes = tokio::fs::read(&archive.path)
            .await
            .with_context(|| format!("Failed to read upload {}", archive.path.display()))?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stored_name() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            stored_name("inat-export.ZIP", now).unwrap(),
            "inat-export_20240309140507.zip"
        );
        assert_eq!(
            stored_name("../../etc/dwca.zip", now).unwrap(),
            "dwca_20240309140507.zip"
        );
    }

    #[test]
    fn test_only_zip_accepted() {
        let now = Utc::now();
        for name in ["export.tar.gz", "export", "export.zip.txt", ".zip"] {
            assert!(
                matches!(stored_name(name, now), Err(ObsdpError::InvalidArgument(_))),
                "{name} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_persist_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ArchiveInbox::new(dir.path().join("uploads"));

        let archive = inbox
            .persist("biologg.zip", b"PK\x03\x04", Some(SourceId(12)))
            .await
            .unwrap();
        assert!(archive.handle.starts_with("biologg_"));
        assert_eq!(archive.size, 4);
        assert_eq!(archive.sha256.len(), 64);

        assert_eq!(inbox.read(&archive.handle).await.unwrap(), b"PK\x03\x04");
        let latest = inbox.latest_for_source(SourceId(12)).await.unwrap();
        assert_eq!(latest.handle, archive.handle);
        assert!(inbox.latest_for_source(SourceId(11)).await.is_none());
    }

    #[tokio::test]
    async fn test_persist_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ArchiveInbox::new(dir.path());

        let first = inbox.persist("a.zip", b"first", None).await.unwrap();
        std::fs::write(&first.path, b"stale").unwrap();
        let second = inbox.persist("a.zip", b"second", None).await.unwrap();

        assert_eq!(std::fs::read(&second.path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_rejected_upload_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ArchiveInbox::new(dir.path());

        assert!(inbox.persist("notes.txt", b"x", None).await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let inbox = ArchiveInbox::new("/nonexistent");
        assert!(matches!(inbox.get("nope.zip").await, Err(ObsdpError::NotFound(_))));
    }
}
