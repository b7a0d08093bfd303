//! Report persistence
//!
//! A report and its artifact are stored and deleted together.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsdp_common::types::{ReportId, SourceId};
use obsdp_common::{ObsdpError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ReportArtifact, ValidationReport};

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn put(&self, report: ValidationReport, artifact: ReportArtifact) -> Result<ReportId>;

    async fn get(&self, id: ReportId) -> Result<ValidationReport>;

    async fn artifact(&self, id: ReportId) -> Result<ReportArtifact>;

    /// Every report, newest first
    async fn list_all(&self) -> Result<Vec<ValidationReport>>;

    /// Delete a report and its artifact
    async fn delete(&self, id: ReportId) -> Result<()>;

    /// Delete every report created before `cutoff`; returns how many were deleted
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn delete_older_than(&self, age: chrono::Duration) -> Result<usize> {
        self.delete_created_before(Utc::now() - age).await
    }

    /// Whether any stored report is about `source_id`
    async fn references_source(&self, source_id: SourceId) -> Result<bool> {
        Ok(self
            .list_all()
            .await?
            .iter()
            .any(|r| r.source_ref.source_id() == Some(source_id)))
    }
}

fn newest_first(reports: &mut [ValidationReport]) {
    reports.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

fn missing(id: ReportId) -> ObsdpError {
    ObsdpError::not_found(format!("report {id}"))
}

/// Reports held in memory
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: RwLock<BTreeMap<ReportId, (ValidationReport, ReportArtifact)>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn put(&self, report: ValidationReport, artifact: ReportArtifact) -> Result<ReportId> {
        let id = report.id;
        self.reports.write().await.insert(id, (report, artifact));
        Ok(id)
    }

    async fn get(&self, id: ReportId) -> Result<ValidationReport> {
        self.reports
            .read()
            .await
            .get(&id)
            .map(|(report, _)| report.clone())
            .ok_or_else(|| missing(id))
    }

    async fn artifact(&self, id: ReportId) -> Result<ReportArtifact> {
        self.reports
            .read()
            .await
            .get(&id)
            .map(|(_, artifact)| artifact.clone())
            .ok_or_else(|| missing(id))
    }

    async fn list_all(&self) -> Result<Vec<ValidationReport>> {
        let mut reports: Vec<_> = self
            .reports
            .read()
            .await
            .values()
            .map(|(report, _)| report.clone())
            .collect();
        newest_first(&mut reports);
        Ok(reports)
    }

    async fn delete(&self, id: ReportId) -> Result<()> {
        self.reports
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing(id))
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut reports = self.reports.write().await;
        let before = reports.len();
        reports.retain(|_, (report, _)| report.created_at >= cutoff);
        Ok(before - reports.len())
    }
}

const METADATA_EXT: &str = "json";
const ARTIFACT_EXT: &str = "artifact";
const TMP_EXT: &str = "tmp";
/// Files of a delete in progress; moved back on open
const STAGING_PREFIX: &str = ".staging-";
/// Files of a committed delete; removed on open
const DELETING_PREFIX: &str = ".deleting-";

/// Reports stored as files: `<id>.json` metadata next to `<id>.artifact` bytes
///
/// A delete moves every affected file into a per-call staging directory and
/// only removes that directory once all moves succeeded, so a bulk delete takes
/// either every report or none. Leftovers of an interrupted call are resolved
/// on [`FsReportStore::open`].
pub struct FsReportStore {
    dir: PathBuf,
    /// Serializes writers; readers go straight to the filesystem
    write_lock: tokio::sync::Mutex<()>,
    #[cfg(test)]
    fail_move_of: std::sync::Mutex<Option<ReportId>>,
}

impl FsReportStore {
    /// Open (and create) a report directory, cleaning up interrupted writes
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;

        let store = Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
            #[cfg(test)]
            fail_move_of: std::sync::Mutex::new(None),
        };
        store.sweep().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: ReportId, ext: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ext}"))
    }

    async fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .context("Failed to list report directory")?;
        while let Some(entry) = entries.next_entry().await.context("Failed to list report directory")? {
            paths.push(entry.path());
        }
        Ok(paths)
    }

    /// Roll back unfinished deletes, finish committed ones, and drop temp files
    /// and artifacts whose metadata never landed
    async fn sweep(&self) -> Result<()> {
        for path in self.entries().await? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.starts_with(STAGING_PREFIX) {
                let mut staged = tokio::fs::read_dir(&path)
                    .await
                    .with_context(|| format!("Failed to list {}", path.display()))?;
                while let Some(entry) = staged.next_entry().await? {
                    tokio::fs::rename(entry.path(), self.dir.join(entry.file_name()))
                        .await
                        .with_context(|| format!("Failed to restore {}", entry.path().display()))?;
                }
                tokio::fs::remove_dir(&path).await?;
                info!(path = %path.display(), "Rolled back interrupted report delete");
            } else if name.starts_with(DELETING_PREFIX) {
                tokio::fs::remove_dir_all(&path).await?;
                debug!(path = %path.display(), "Finished interrupted report delete");
            } else if path.extension().and_then(|e| e.to_str()) == Some(TMP_EXT) {
                tokio::fs::remove_file(&path).await?;
                debug!(path = %path.display(), "Removed stale temp file");
            }
        }

        for path in self.entries().await? {
            if path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXT)
                && !tokio::fs::try_exists(path.with_extension(METADATA_EXT)).await?
            {
                tokio::fs::remove_file(&path).await?;
                warn!(path = %path.display(), "Removed artifact without report metadata");
            }
        }
        Ok(())
    }

    async fn read_metadata(&self, path: &Path) -> Result<ValidationReport> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read report metadata {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!("{}.{TMP_EXT}", Uuid::now_v7().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(anyhow::Error::new(err)
                .context(format!("Failed to move {} into place", path.display()))
                .into());
        }
        Ok(())
    }

    /// Delete `ids` as one unit; caller holds the write lock
    async fn remove_all(&self, ids: &[ReportId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let batch = Uuid::now_v7().simple().to_string();
        let staging = self.dir.join(format!("{STAGING_PREFIX}{batch}"));
        tokio::fs::create_dir(&staging)
            .await
            .with_context(|| format!("Failed to create {}", staging.display()))?;

        let mut moved = Vec::new();
        for id in ids {
            if let Err(err) = self.stage(*id, &staging, &mut moved).await {
                warn!(report_id = %id, error = %err, "Report delete failed, restoring staged reports");
                restore(&moved).await;
                tokio::fs::remove_dir(&staging).await.ok();
                return Err(err);
            }
        }

        let deleting = self.dir.join(format!("{DELETING_PREFIX}{batch}"));
        if let Err(err) = tokio::fs::rename(&staging, &deleting).await {
            restore(&moved).await;
            tokio::fs::remove_dir(&staging).await.ok();
            return Err(anyhow::Error::new(err)
                .context("Failed to commit report delete")
                .into());
        }
        if let Err(err) = tokio::fs::remove_dir_all(&deleting).await {
            warn!(path = %deleting.display(), error = %err, "Deleted reports left on disk until next open");
        }
        Ok(ids.len())
    }

    async fn stage(&self, id: ReportId, staging: &Path, moved: &mut Vec<(PathBuf, PathBuf)>) -> Result<()> {
        let metadata = self.path(id, METADATA_EXT);
        let staged = staging.join(format!("{id}.{METADATA_EXT}"));
        match tokio::fs::rename(&metadata, &staged).await {
            Ok(()) => moved.push((metadata, staged)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(missing(id)),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("Failed to delete report {id}"))
                    .into())
            },
        }

        #[cfg(test)]
        if *self.fail_move_of.lock().unwrap_or_else(|p| p.into_inner()) == Some(id) {
            return Err(anyhow::anyhow!("artifact of report {id} is locked").into());
        }

        let artifact = self.path(id, ARTIFACT_EXT);
        let staged = staging.join(format!("{id}.{ARTIFACT_EXT}"));
        match tokio::fs::rename(&artifact, &staged).await {
            Ok(()) => moved.push((artifact, staged)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("Failed to delete artifact of report {id}"))
                    .into())
            },
        }
        Ok(())
    }
}

/// Move staged files back; anything left behind is restored on the next open
async fn restore(moved: &[(PathBuf, PathBuf)]) {
    for (original, staged) in moved.iter().rev() {
        if let Err(err) = tokio::fs::rename(staged, original).await {
            warn!(path = %original.display(), error = %err, "Failed to restore report file");
        }
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn put(&self, report: ValidationReport, artifact: ReportArtifact) -> Result<ReportId> {
        let _write = self.write_lock.lock().await;
        let id = report.id;
        let metadata = serde_json::to_vec_pretty(&report)?;

        let artifact_path = self.path(id, ARTIFACT_EXT);
        self.write_atomic(&artifact_path, &artifact.bytes).await?;
        if let Err(err) = self.write_atomic(&self.path(id, METADATA_EXT), &metadata).await {
            if let Err(cleanup) = tokio::fs::remove_file(&artifact_path).await {
                warn!(report_id = %id, error = %cleanup, "Failed to remove artifact of unstored report");
            }
            return Err(err);
        }

        debug!(report_id = %id, "Report stored");
        Ok(id)
    }

    async fn get(&self, id: ReportId) -> Result<ValidationReport> {
        let path = self.path(id, METADATA_EXT);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(missing(id));
        }
        self.read_metadata(&path).await
    }

    async fn artifact(&self, id: ReportId) -> Result<ReportArtifact> {
        let report = self.get(id).await?;
        let bytes = match tokio::fs::read(self.path(id, ARTIFACT_EXT)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(missing(id)),
            Err(err) => return Err(err.into()),
        };
        Ok(ReportArtifact {
            bytes,
            content_type: report.artifact.content_type,
            filename: report.artifact.filename,
        })
    }

    async fn list_all(&self) -> Result<Vec<ValidationReport>> {
        let mut reports = Vec::new();
        for path in self.entries().await? {
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
                continue;
            }
            match self.read_metadata(&path).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    // deleted between listing and reading
                    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                        return Err(err);
                    }
                },
            }
        }
        newest_first(&mut reports);
        Ok(reports)
    }

    async fn delete(&self, id: ReportId) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.remove_all(&[id]).await?;
        info!(report_id = %id, "Report deleted");
        Ok(())
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _write = self.write_lock.lock().await;
        let expired: Vec<ReportId> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.created_at < cutoff)
            .map(|r| r.id)
            .collect();
        self.remove_all(&expired).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::types::{ArtifactRef, ReportCounts, ReportLimits, SourceRef};
    use chrono::Duration;

    fn report(age_days: i64, source: i32) -> (ValidationReport, ReportArtifact) {
        let id = ReportId::generate();
        let report = ValidationReport {
            id,
            created_by: "tester".to_string(),
            source_ref: SourceRef::Source {
                source_id: SourceId(source),
            },
            source_name: "Test".to_string(),
            created_at: Utc::now() - Duration::days(age_days),
            limits: ReportLimits {
                max_read: 10,
                max_valid_samples: 1,
                max_invalid_samples: 1,
            },
            counts: ReportCounts::default(),
            artifact: ArtifactRef {
                filename: format!("{id}.json"),
                content_type: "application/json".to_string(),
            },
        };
        let artifact = ReportArtifact {
            bytes: b"{}".to_vec(),
            content_type: "application/json".to_string(),
            filename: format!("{id}.json"),
        };
        (report, artifact)
    }

    async fn exercise(store: &dyn ReportStore) {
        let (old, old_artifact) = report(40, 1);
        let (new, new_artifact) = report(2, 2);
        store.put(old.clone(), old_artifact).await.unwrap();
        store.put(new.clone(), new_artifact.clone()).await.unwrap();

        let listed: Vec<_> = store.list_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![new.id, old.id]);
        assert_eq!(store.artifact(new.id).await.unwrap(), new_artifact);
        assert!(store.references_source(SourceId(1)).await.unwrap());

        assert_eq!(store.delete_older_than(Duration::days(30)).await.unwrap(), 1);
        assert!(matches!(store.get(old.id).await, Err(ObsdpError::NotFound(_))));
        assert!(matches!(store.artifact(old.id).await, Err(ObsdpError::NotFound(_))));
        assert!(!store.references_source(SourceId(1)).await.unwrap());

        store.delete(new.id).await.unwrap();
        assert!(matches!(store.delete(new.id).await, Err(ObsdpError::NotFound(_))));
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryReportStore::new()).await;
    }

    #[tokio::test]
    async fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::open(dir.path()).await.unwrap();
        exercise(&store).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (r, a) = report(1, 3);
        {
            let store = FsReportStore::open(dir.path()).await.unwrap();
            store.put(r.clone(), a.clone()).await.unwrap();
        }
        let store = FsReportStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get(r.id).await.unwrap(), r);
        assert_eq!(store.artifact(r.id).await.unwrap().bytes, a.bytes);
    }

    #[tokio::test]
    async fn test_fs_bulk_delete_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::open(dir.path()).await.unwrap();
        let mut expired = Vec::new();
        for age in [31, 45, 100] {
            let (r, a) = report(age, 1);
            store.put(r.clone(), a).await.unwrap();
            expired.push(r.id);
        }
        let (fresh, fresh_artifact) = report(1, 2);
        store.put(fresh.clone(), fresh_artifact).await.unwrap();

        // the oldest report is moved last
        *store.fail_move_of.lock().unwrap() = Some(expired[2]);
        assert!(store.delete_older_than(Duration::days(30)).await.is_err());

        assert_eq!(store.list_all().await.unwrap().len(), 4);
        for id in &expired {
            assert_eq!(store.artifact(*id).await.unwrap().bytes, b"{}".to_vec());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 8);

        *store.fail_move_of.lock().unwrap() = None;
        assert_eq!(store.delete_older_than(Duration::days(30)).await.unwrap(), 3);
        let remaining: Vec<_> = store.list_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![fresh.id]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_fs_put_failure_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::open(dir.path()).await.unwrap();
        let (r, a) = report(1, 3);

        // a non-empty directory squatting on the metadata path makes the final rename fail
        let metadata = dir.path().join(format!("{}.json", r.id));
        std::fs::create_dir(&metadata).unwrap();
        std::fs::write(metadata.join("keep"), b"x").unwrap();

        assert!(store.put(r.clone(), a).await.is_err());
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", r.id)]);
    }

    #[tokio::test]
    async fn test_fs_open_resolves_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let (staged, staged_artifact) = report(1, 3);
        let (committed, committed_artifact) = report(2, 4);
        let (orphan, orphan_artifact) = report(3, 5);
        {
            let store = FsReportStore::open(dir.path()).await.unwrap();
            store.put(staged.clone(), staged_artifact).await.unwrap();
            store.put(committed.clone(), committed_artifact).await.unwrap();
            store.put(orphan.clone(), orphan_artifact).await.unwrap();
        }

        // one delete interrupted while staging, one after committing
        let staging = dir.path().join(".staging-a");
        let deleting = dir.path().join(".deleting-b");
        std::fs::create_dir(&staging).unwrap();
        std::fs::create_dir(&deleting).unwrap();
        for ext in ["json", "artifact"] {
            let name = format!("{}.{ext}", staged.id);
            std::fs::rename(dir.path().join(&name), staging.join(&name)).unwrap();
            let name = format!("{}.{ext}", committed.id);
            std::fs::rename(dir.path().join(&name), deleting.join(&name)).unwrap();
        }
        std::fs::remove_file(dir.path().join(format!("{}.json", orphan.id))).unwrap();
        std::fs::write(dir.path().join(format!("{}.0190.tmp", staged.id)), b"partial").unwrap();

        let store = FsReportStore::open(dir.path()).await.unwrap();
        let listed: Vec<_> = store.list_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![staged.id]);
        assert_eq!(store.artifact(staged.id).await.unwrap().bytes, b"{}".to_vec());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
