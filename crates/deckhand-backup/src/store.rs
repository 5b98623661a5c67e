//! Artifact directory layout.
//!
//! ```text
//! backups/
//!   database_<id>.sql.gz    mandatory
//!   appdata_<id>.json.gz    optional
//!   media_<id>.tar.gz       optional
//!   config_<id>.tar.gz      optional
//!   manifest_<id>.txt
//! ```
//!
//! There is no index: sets are discovered by parsing file names, and the
//! id embedded in each name is the only thing tying files of one set
//! together. Files that do not follow the layout are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use deckhand_core::{ArtifactKind, BackupId};

use crate::error::{BackupError, BackupResult};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// One artifact of a set, present or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub present: bool,
    /// Where the artifact lives, or would live.
    pub path: PathBuf,
    /// Size in bytes; zero when absent.
    pub size: u64,
}

/// A named, multi-artifact point-in-time snapshot.
#[derive(Debug, Clone)]
pub struct BackupSet {
    pub id: BackupId,
    pub created_at: Option<NaiveDateTime>,
    /// One entry per [`ArtifactKind`], always fully populated.
    pub artifacts: BTreeMap<ArtifactKind, ArtifactEntry>,
    pub manifest_text: Option<String>,
}

impl BackupSet {
    /// A set can be restored iff its datastore dump exists.
    pub fn is_restorable(&self) -> bool {
        self.is_present(ArtifactKind::Database)
    }

    pub fn is_present(&self, kind: ArtifactKind) -> bool {
        self.artifacts.get(&kind).is_some_and(|a| a.present)
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactEntry> {
        self.artifacts.get(&kind)
    }

    pub fn total_size(&self) -> u64 {
        self.artifacts.values().map(|a| a.size).sum()
    }
}

/// Files removed by a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    /// Layout files inspected and kept.
    pub kept: usize,
}

/// A file that follows the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredFile {
    Artifact(ArtifactKind, BackupId),
    Manifest(BackupId),
}

impl StoredFile {
    fn parse(name: &str) -> Option<Self> {
        if let Some((kind, id)) = ArtifactKind::parse_file_name(name) {
            return Some(StoredFile::Artifact(kind, id));
        }
        let id = name.strip_prefix("manifest_")?.strip_suffix(".txt")?;
        BackupId::parse(id).map(StoredFile::Manifest)
    }

    fn id(&self) -> &BackupId {
        match self {
            StoredFile::Artifact(_, id) | StoredFile::Manifest(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the artifact directory if needed.
    pub fn ensure(&self) -> BackupResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| BackupError::io(&self.dir, e))
    }

    pub fn path(&self, kind: ArtifactKind, id: &BackupId) -> PathBuf {
        self.dir.join(kind.file_name(id))
    }

    pub fn manifest_path(&self, id: &BackupId) -> PathBuf {
        self.dir.join(format!("manifest_{id}.txt"))
    }

    /// Write one artifact. A partially written file is removed on failure.
    pub fn write(&self, kind: ArtifactKind, id: &BackupId, bytes: &[u8]) -> BackupResult<ArtifactEntry> {
        let path = self.path(kind, id);
        if let Err(e) = fs::write(&path, bytes) {
            let _ = fs::remove_file(&path);
            return Err(BackupError::io(path, e));
        }
        debug!(%kind, path = %path.display(), size = bytes.len(), "artifact written");
        Ok(ArtifactEntry {
            present: true,
            path,
            size: bytes.len() as u64,
        })
    }

    pub fn write_manifest(&self, id: &BackupId, text: &str) -> BackupResult<PathBuf> {
        let path = self.manifest_path(id);
        fs::write(&path, text).map_err(|e| BackupError::io(&path, e))?;
        Ok(path)
    }

    pub fn read(&self, kind: ArtifactKind, id: &BackupId) -> BackupResult<Vec<u8>> {
        let path = self.path(kind, id);
        fs::read(&path).map_err(|e| BackupError::io(path, e))
    }

    /// Whether any file of set `id` exists.
    pub fn exists_any(&self, id: &BackupId) -> bool {
        self.manifest_path(id).exists() || ArtifactKind::ALL.iter().any(|k| self.path(*k, id).exists())
    }

    /// Remove every file of set `id`.
    pub fn remove_set(&self, id: &BackupId) -> BackupResult<()> {
        let paths = ArtifactKind::ALL
            .iter()
            .map(|k| self.path(*k, id))
            .chain(std::iter::once(self.manifest_path(id)));
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(BackupError::io(path, e)),
            }
        }
        Ok(())
    }

    /// Describe set `id` from whatever files exist. Never fails for missing
    /// artifacts; those are reported as absent.
    pub fn load(&self, id: &BackupId) -> BackupResult<BackupSet> {
        let mut artifacts = BTreeMap::new();
        for kind in ArtifactKind::ALL {
            let path = self.path(kind, id);
            let entry = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => ArtifactEntry {
                    present: true,
                    path,
                    size: meta.len(),
                },
                Ok(_) => ArtifactEntry {
                    present: false,
                    path,
                    size: 0,
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => ArtifactEntry {
                    present: false,
                    path,
                    size: 0,
                },
                Err(e) => return Err(BackupError::io(path, e)),
            };
            artifacts.insert(kind, entry);
        }

        let manifest_path = self.manifest_path(id);
        let manifest_text = match fs::read_to_string(&manifest_path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(BackupError::io(manifest_path, e)),
        };

        Ok(BackupSet {
            id: id.clone(),
            created_at: id.created_at(),
            artifacts,
            manifest_text,
        })
    }

    /// Ids of every set with at least one file, newest first.
    pub fn list_ids(&self) -> BackupResult<Vec<BackupId>> {
        let ids: BTreeSet<BackupId> = self
            .stored_files()?
            .into_iter()
            .map(|(_, file)| file.id().clone())
            .collect();
        Ok(ids.into_iter().rev().collect())
    }

    /// Delete every layout file whose age strictly exceeds `retention_days`.
    ///
    /// Each file is judged on its own modification time, so a set can lose
    /// some kinds and keep others.
    pub fn prune(&self, retention_days: u32, now: SystemTime) -> BackupResult<PruneReport> {
        let max_age = Duration::from_secs(u64::from(retention_days) * SECS_PER_DAY);
        let mut report = PruneReport::default();

        for (path, file) in self.stored_files()? {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(|e| BackupError::io(&path, e))?;
            // Timestamps in the future count as fresh.
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                fs::remove_file(&path).map_err(|e| BackupError::io(&path, e))?;
                info!(
                    path = %path.display(),
                    id = %file.id(),
                    age_days = age.as_secs() / SECS_PER_DAY,
                    "pruned old backup file"
                );
                report.removed.push(path);
            } else {
                report.kept += 1;
            }
        }

        Ok(report)
    }

    fn stored_files(&self) -> BackupResult<Vec<(PathBuf, StoredFile)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::io(&self.dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match StoredFile::parse(name) {
                Some(file) if entry.path().is_file() => files.push((entry.path(), file)),
                Some(_) => warn!(path = %entry.path().display(), "not a regular file, ignored"),
                None => {}
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const DAY: Duration = Duration::from_secs(SECS_PER_DAY);

    fn id(s: &str) -> BackupId {
        BackupId::parse(s).unwrap()
    }

    fn age(path: &Path, now: SystemTime, by: Duration) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(now - by)
            .unwrap();
    }

    #[test]
    fn load_reports_absent_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let set_id = id("20240301_120000");
        store.write(ArtifactKind::Database, &set_id, b"dump").unwrap();
        store.write_manifest(&set_id, "manifest").unwrap();

        let set = store.load(&set_id).unwrap();
        assert!(set.is_restorable());
        assert!(!set.is_present(ArtifactKind::Media));
        assert_eq!(set.artifact(ArtifactKind::Database).unwrap().size, 4);
        assert_eq!(set.manifest_text.as_deref(), Some("manifest"));
        assert_eq!(set.artifacts.len(), 4);
        assert!(set.created_at.is_some());
    }

    #[test]
    fn set_without_database_is_not_restorable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let set_id = id("20240301_120000");
        store.write(ArtifactKind::AppState, &set_id, b"{}").unwrap();
        assert!(!store.load(&set_id).unwrap().is_restorable());
    }

    #[test]
    fn list_ids_newest_first_and_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let older = id("20240101_000000");
        let newer = id("20240202_000000");
        store.write(ArtifactKind::Database, &older, b"a").unwrap();
        store.write(ArtifactKind::Media, &older, b"a").unwrap();
        store.write_manifest(&newer, "m").unwrap();
        fs::write(tmp.path().join("README"), "not a backup").unwrap();
        fs::write(tmp.path().join("database_latest.sql.gz"), "x").unwrap();

        assert_eq!(store.list_ids().unwrap(), vec![newer, older]);
    }

    #[test]
    fn list_ids_of_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("nope"));
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn prune_is_strict_and_per_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let set_id = id("20240101_000000");
        let now = SystemTime::now();

        let db = store.write(ArtifactKind::Database, &set_id, b"d").unwrap().path;
        let media = store.write(ArtifactKind::Media, &set_id, b"m").unwrap().path;
        let config = store.write(ArtifactKind::Config, &set_id, b"c").unwrap().path;
        let manifest = store.write_manifest(&set_id, "m").unwrap();

        age(&db, now, 31 * DAY);
        age(&media, now, 29 * DAY);
        // Exactly at the threshold is kept.
        age(&config, now, 30 * DAY);
        age(&manifest, now, 31 * DAY);

        let report = store.prune(30, now).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.kept, 2);
        assert!(!db.exists());
        assert!(!manifest.exists());
        assert!(media.exists());
        assert!(config.exists());

        let set = store.load(&set_id).unwrap();
        assert!(!set.is_restorable());
        assert!(set.is_present(ArtifactKind::Media));
    }

    #[test]
    fn prune_leaves_foreign_files_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let foreign = tmp.path().join("notes.txt");
        fs::write(&foreign, "keep me").unwrap();
        let now = SystemTime::now();
        age(&foreign, now, 400 * DAY);

        let report = store.prune(30, now).unwrap();
        assert!(report.removed.is_empty());
        assert!(foreign.exists());
    }

    #[test]
    fn remove_set_only_touches_that_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let a = id("20240101_000000");
        let b = id("20240101_000001");
        store.write(ArtifactKind::Database, &a, b"a").unwrap();
        store.write(ArtifactKind::Database, &b, b"b").unwrap();

        store.remove_set(&a).unwrap();
        assert!(!store.exists_any(&a));
        assert!(store.exists_any(&b));
    }
}
