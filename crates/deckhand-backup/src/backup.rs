//! Backup manager — creates backup sets and prunes old ones.
//!
//! Creation order matters: the datastore dump is taken and written first
//! and is the only fatal step. The app-state export, media archive and
//! config archive are best effort and degrade to an absent artifact with
//! a recorded reason. The manifest is written last.

use std::future::Future;
use std::time::SystemTime;

use tracing::{info, warn};

use deckhand_control::ServiceControlPlane;
use deckhand_core::{ArtifactKind, BackupId, CollisionPolicy, DeckhandConfig};

use crate::archive;
use crate::datastore::{AppStateStore, Datastore, ManagementAppState, PostgresDatastore};
use crate::error::{BackupError, BackupResult};
use crate::manifest::{self, ManifestEntry};
use crate::store::{ArtifactStore, BackupSet, PruneReport};

/// Result of a successful backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub id: BackupId,
    pub set: BackupSet,
    /// Optional artifacts that could not be created.
    pub warnings: Vec<String>,
}

/// Anything that can take a backup before the stack is changed.
pub trait Snapshotter: Send + Sync {
    fn snapshot(&self) -> impl Future<Output = BackupResult<BackupId>> + Send;
}

pub struct BackupManager<'a, C, D = PostgresDatastore<'a, C>, A = ManagementAppState<'a, C>> {
    plane: &'a C,
    datastore: D,
    app_state: A,
    store: ArtifactStore,
    config: &'a DeckhandConfig,
}

impl<'a, C: ServiceControlPlane> BackupManager<'a, C> {
    /// Manager using the PostgreSQL and management-command adapters.
    pub fn new(plane: &'a C, config: &'a DeckhandConfig) -> Self {
        Self::with_adapters(
            plane,
            PostgresDatastore::from_config(plane, config),
            ManagementAppState::from_config(plane, config),
            config,
        )
    }
}

impl<'a, C, D, A> BackupManager<'a, C, D, A>
where
    C: ServiceControlPlane,
    D: Datastore,
    A: AppStateStore,
{
    pub fn with_adapters(plane: &'a C, datastore: D, app_state: A, config: &'a DeckhandConfig) -> Self {
        Self {
            plane,
            datastore,
            app_state,
            store: ArtifactStore::new(config.backup_dir()),
            config,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Create a backup set stamped with the current time.
    pub async fn create_backup(&self) -> BackupResult<BackupReport> {
        self.create_backup_with_id(BackupId::now()).await
    }

    pub async fn create_backup_with_id(&self, id: BackupId) -> BackupResult<BackupReport> {
        self.store.ensure()?;

        let overwrite = self.store.exists_any(&id);
        if overwrite && self.config.backup.on_collision == CollisionPolicy::Reject {
            warn!(%id, "a backup with this id already exists");
            return Err(BackupError::IdCollision(id.to_string()));
        }

        info!(%id, dir = %self.store.dir().display(), "creating backup");
        let mut entries = Vec::with_capacity(ArtifactKind::ALL.len());
        let mut warnings = Vec::new();

        // Database: fatal on failure, nothing has been written or removed yet.
        let dump = self.datastore.dump().await.map_err(BackupError::Dump)?;
        if overwrite {
            warn!(%id, "overwriting existing backup with the same id");
            self.store.remove_set(&id)?;
        }
        let packed = archive::gzip(&dump)
            .map_err(|e| BackupError::io(self.store.path(ArtifactKind::Database, &id), e))?;
        let written = self.store.write(ArtifactKind::Database, &id, &packed)?;
        info!(%id, size = written.size, "database dump written");
        entries.push(ManifestEntry::written(
            ArtifactKind::Database,
            ArtifactKind::Database.file_name(&id),
            written.size,
        ));

        entries.push(self.backup_app_state(&id, &mut warnings).await);
        entries.push(self.backup_media(&id, &mut warnings));
        entries.push(self.backup_config(&id, &mut warnings));

        let status = match self.plane.status().await {
            Ok(states) => Some(states),
            Err(e) => {
                warn!(error = %e, "system status unavailable for manifest");
                None
            }
        };
        let text = manifest::render(&id, &entries, status.as_deref());
        self.store.write_manifest(&id, &text)?;

        let set = self.store.load(&id)?;
        info!(
            %id,
            total_size = set.total_size(),
            degraded = warnings.len(),
            "backup complete"
        );
        Ok(BackupReport { id, set, warnings })
    }

    async fn backup_app_state(&self, id: &BackupId, warnings: &mut Vec<String>) -> ManifestEntry {
        let kind = ArtifactKind::AppState;
        let exported = match self.app_state.export(&self.config.backup.app_state_exclude).await {
            Ok(bytes) if bytes.is_empty() => Err("export produced no data".to_string()),
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(format!("export failed: {e}")),
        };
        let result = exported.and_then(|bytes| {
            let packed = archive::gzip(&bytes).map_err(|e| e.to_string())?;
            self.store.write(kind, id, &packed).map_err(|e| e.to_string())
        });
        degrade(kind, id, result, warnings)
    }

    fn backup_media(&self, id: &BackupId, warnings: &mut Vec<String>) -> ManifestEntry {
        let kind = ArtifactKind::Media;
        let media_dir = self.config.media_dir();
        match archive::archive_dir(&media_dir) {
            Ok(None) => {
                info!(dir = %media_dir.display(), "media directory empty, skipped");
                ManifestEntry::absent(kind, "media directory is empty")
            }
            Ok(Some(blob)) => {
                let result = self.store.write(kind, id, &blob).map_err(|e| e.to_string());
                degrade(kind, id, result, warnings)
            }
            Err(e) => degrade(kind, id, Err(format!("archive failed: {e}")), warnings),
        }
    }

    fn backup_config(&self, id: &BackupId, warnings: &mut Vec<String>) -> ManifestEntry {
        let kind = ArtifactKind::Config;
        match archive::archive_files(&self.config.project.dir, &self.config.backup.config_paths) {
            Ok(None) => {
                info!("no configuration files found, skipped");
                ManifestEntry::absent(kind, "no configuration files found")
            }
            Ok(Some(blob)) => {
                let result = self.store.write(kind, id, &blob).map_err(|e| e.to_string());
                degrade(kind, id, result, warnings)
            }
            Err(e) => degrade(kind, id, Err(format!("archive failed: {e}")), warnings),
        }
    }

    /// Delete artifact files older than `retention_days`, each kind on its own.
    pub fn prune_old_backups(&self, retention_days: u32) -> BackupResult<PruneReport> {
        let report = self.store.prune(retention_days, SystemTime::now())?;
        info!(
            retention_days,
            removed = report.removed.len(),
            kept = report.kept,
            "retention pass complete"
        );
        Ok(report)
    }
}

/// Turn an optional artifact's outcome into a manifest entry, downgrading
/// failures to warnings.
fn degrade(
    kind: ArtifactKind,
    id: &BackupId,
    result: Result<crate::store::ArtifactEntry, String>,
    warnings: &mut Vec<String>,
) -> ManifestEntry {
    match result {
        Ok(entry) => {
            info!(%kind, size = entry.size, "artifact written");
            ManifestEntry::written(kind, kind.file_name(id), entry.size)
        }
        Err(reason) => {
            warn!(%kind, %reason, "optional artifact skipped");
            warnings.push(format!("{kind}: {reason}"));
            ManifestEntry::absent(kind, reason)
        }
    }
}

impl<C, D, A> Snapshotter for BackupManager<'_, C, D, A>
where
    C: ServiceControlPlane,
    D: Datastore,
    A: AppStateStore,
{
    async fn snapshot(&self) -> BackupResult<BackupId> {
        self.create_backup().await.map(|report| report.id)
    }
}
