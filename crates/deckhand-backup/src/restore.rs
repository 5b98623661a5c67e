//! Guarded restore of a backup set.
//!
//! Everything that can be checked without touching the stack is checked
//! before the operator is asked: the set must exist with a datastore dump,
//! and every artifact that will be used must decode. Only after a positive
//! confirmation are services stopped and the datastore recreated.

use tracing::{info, warn};

use deckhand_control::{HealthProbe, HealthVerdict, ServiceControlPlane, poll_until_healthy};
use deckhand_core::{ArtifactKind, BackupId, DeckhandConfig, ServiceRole};

use crate::archive;
use crate::datastore::{AppStateStore, Datastore, ManagementAppState, PostgresDatastore};
use crate::error::{BackupError, BackupResult};
use crate::store::{ArtifactStore, BackupSet};

/// Operator confirmation before a destructive restore.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F: Fn(&str) -> bool> Confirm for F {
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Confirms everything, for `--yes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub restore_media: bool,
    pub restore_config: bool,
}

#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    /// The operator declined; nothing was touched.
    Cancelled,
    Restored(RestoreReport),
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub id: BackupId,
    pub media_restored: bool,
    pub config_restored: bool,
    pub app_state_reimported: bool,
    /// Post-restore health. Reported only, never acted on.
    pub health: HealthVerdict,
    pub warnings: Vec<String>,
}

/// Decoded artifacts of a set, ready to be applied.
struct Prepared {
    dump: Vec<u8>,
    media: Option<Vec<u8>>,
    config: Option<Vec<u8>>,
    app_state: Option<Vec<u8>>,
}

pub struct RestoreManager<'a, C, H, D = PostgresDatastore<'a, C>, A = ManagementAppState<'a, C>> {
    plane: &'a C,
    probe: &'a H,
    datastore: D,
    app_state: A,
    store: ArtifactStore,
    config: &'a DeckhandConfig,
}

impl<'a, C: ServiceControlPlane, H: HealthProbe> RestoreManager<'a, C, H> {
    pub fn new(plane: &'a C, probe: &'a H, config: &'a DeckhandConfig) -> Self {
        Self::with_adapters(
            plane,
            probe,
            PostgresDatastore::from_config(plane, config),
            ManagementAppState::from_config(plane, config),
            config,
        )
    }
}

impl<'a, C, H, D, A> RestoreManager<'a, C, H, D, A>
where
    C: ServiceControlPlane,
    H: HealthProbe,
    D: Datastore,
    A: AppStateStore,
{
    pub fn with_adapters(
        plane: &'a C,
        probe: &'a H,
        datastore: D,
        app_state: A,
        config: &'a DeckhandConfig,
    ) -> Self {
        Self {
            plane,
            probe,
            datastore,
            app_state,
            store: ArtifactStore::new(config.backup_dir()),
            config,
        }
    }

    /// Ids found in the artifact directory, newest first.
    pub fn list_available(&self) -> BackupResult<Vec<BackupId>> {
        self.store.list_ids()
    }

    /// Every discoverable set, newest first, restorable or not.
    pub fn list_sets(&self) -> BackupResult<Vec<BackupSet>> {
        self.store
            .list_ids()?
            .iter()
            .map(|id| self.store.load(id))
            .collect()
    }

    pub async fn restore<F: Confirm>(
        &self,
        id: &BackupId,
        options: RestoreOptions,
        confirm: &F,
    ) -> BackupResult<RestoreOutcome> {
        let set = self.store.load(id)?;
        if !set.is_restorable() {
            warn!(%id, "no database artifact for this id");
            return Err(BackupError::NotFound(id.to_string()));
        }

        let mut warnings = Vec::new();
        let prepared = self.prepare(&set, options, &mut warnings)?;

        let prompt = self.prompt(&set, &prepared);
        if !confirm.confirm(&prompt) {
            info!(%id, "restore cancelled by operator");
            return Ok(RestoreOutcome::Cancelled);
        }

        info!(%id, "restoring backup");
        let failed = |step: &'static str| {
            move |e: deckhand_control::ControlError| BackupError::Restore {
                id: id.to_string(),
                step,
                reason: e.to_string(),
            }
        };

        let stopped = self.config.services.names(&ServiceRole::STOPPED_FOR_RESTORE);
        self.plane
            .stop(&stopped)
            .await
            .map_err(failed("stop application services"))?;
        info!(services = ?stopped, "application services stopped");

        self.datastore
            .drop_database()
            .await
            .map_err(failed("drop the database"))?;
        self.datastore
            .create_database()
            .await
            .map_err(failed("create the database"))?;
        self.datastore
            .restore(prepared.dump)
            .await
            .map_err(failed("load the dump"))?;
        info!(%id, "database restored");

        let media_restored = match &prepared.media {
            Some(blob) => {
                let dir = self.config.media_dir();
                match archive::replace_dir(blob, &dir) {
                    Ok(()) => {
                        info!(dir = %dir.display(), "media restored");
                        true
                    }
                    Err(e) => {
                        note(&mut warnings, format!("media restore failed: {e}"));
                        false
                    }
                }
            }
            None => false,
        };

        let config_restored = match &prepared.config {
            Some(blob) => match archive::extract(blob, &self.config.project.dir) {
                Ok(()) => {
                    info!("configuration files restored");
                    true
                }
                Err(e) => {
                    note(&mut warnings, format!("config restore failed: {e}"));
                    false
                }
            },
            None => false,
        };

        self.plane
            .start(&self.config.services.all())
            .await
            .map_err(failed("start services"))?;
        info!("services started");

        let mut app_state_reimported = false;
        if let Some(data) = prepared.app_state {
            match self.app_state.import(data).await {
                Ok(()) => {
                    info!("app state re-imported");
                    app_state_reimported = true;
                }
                Err(e) => note(&mut warnings, format!("app state import failed: {e}")),
            }
        }

        self.exec_best_effort(
            ServiceRole::Cache,
            &self.config.commands.flush_cache,
            "cache flush",
            &mut warnings,
        )
        .await;
        self.exec_best_effort(
            ServiceRole::Web,
            &self.config.commands.collect_static,
            "static asset collection",
            &mut warnings,
        )
        .await;

        let health = poll_until_healthy(
            self.probe,
            &self.config.rollout.health_endpoint,
            self.config.rollout.probe_timeout(),
            self.config.restore.health.policy(),
        )
        .await;
        if !health.healthy {
            note(
                &mut warnings,
                format!("stack not healthy after {} attempts", health.attempts),
            );
        }

        info!(%id, healthy = health.healthy, warnings = warnings.len(), "restore finished");
        Ok(RestoreOutcome::Restored(RestoreReport {
            id: id.clone(),
            media_restored,
            config_restored,
            app_state_reimported,
            health,
            warnings,
        }))
    }

    /// Read and decode what the restore will use.
    fn prepare(
        &self,
        set: &BackupSet,
        options: RestoreOptions,
        warnings: &mut Vec<String>,
    ) -> BackupResult<Prepared> {
        let id = &set.id;
        let dump = self.decompressed(ArtifactKind::Database, id)?;

        let mut optional = |wanted: bool, kind: ArtifactKind| -> BackupResult<Option<Vec<u8>>> {
            if !wanted {
                return Ok(None);
            }
            if !set.is_present(kind) {
                note(warnings, format!("{kind} requested but not in backup {id}"));
                return Ok(None);
            }
            self.store.read(kind, id).map(Some)
        };
        let media = optional(options.restore_media, ArtifactKind::Media)?;
        let config = optional(options.restore_config, ArtifactKind::Config)?;

        let app_state = if self.config.restore.reimport_app_state {
            if set.is_present(ArtifactKind::AppState) {
                Some(self.decompressed(ArtifactKind::AppState, id)?)
            } else {
                note(warnings, format!("no app state export in backup {id}, re-import skipped"));
                None
            }
        } else {
            None
        };

        Ok(Prepared {
            dump,
            media,
            config,
            app_state,
        })
    }

    fn decompressed(&self, kind: ArtifactKind, id: &BackupId) -> BackupResult<Vec<u8>> {
        let packed = self.store.read(kind, id)?;
        archive::gunzip(&packed).map_err(|e| BackupError::io(self.store.path(kind, id), e))
    }

    fn prompt(&self, set: &BackupSet, prepared: &Prepared) -> String {
        let mut replaced = vec!["the database"];
        if prepared.media.is_some() {
            replaced.push("the media directory");
        }
        if prepared.config.is_some() {
            replaced.push("configuration files");
        }
        let mut prompt = format!(
            "Restoring backup {} replaces {}. Application services will be stopped.\n",
            set.id,
            replaced.join(", ")
        );
        if let Some(manifest) = &set.manifest_text {
            prompt.push('\n');
            prompt.push_str(manifest);
        }
        prompt
    }

    async fn exec_best_effort(
        &self,
        role: ServiceRole,
        command: &[String],
        what: &str,
        warnings: &mut Vec<String>,
    ) {
        let service = self.config.services.name(role);
        match self.plane.exec(service, command, None).await {
            Ok(_) => info!(%service, "{what} done"),
            Err(e) => note(warnings, format!("{what} failed: {e}")),
        }
    }
}

fn note(warnings: &mut Vec<String>, message: String) {
    warn!("{message}");
    warnings.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use deckhand_control::ProbeResult;
    use deckhand_control::testing::{Call, FakeStack, Op, ScriptedProbe};

    use crate::backup::BackupManager;

    fn config_in(root: &Path) -> DeckhandConfig {
        let mut config = DeckhandConfig::default();
        config.project.dir = root.to_path_buf();
        config.restore.health.interval = "0s".to_string();
        config
    }

    fn stack(config: &DeckhandConfig) -> FakeStack {
        FakeStack::running(&config.services.all())
            .with_database(b"rows at backup time")
            .with_app_state(b"[{\"model\": \"orders.order\"}]")
    }

    async fn backup(stack: &FakeStack, config: &DeckhandConfig) -> BackupId {
        let manager = BackupManager::new(stack, config);
        manager
            .create_backup_with_id(BackupId::parse("20240301_120000").unwrap())
            .await
            .unwrap()
            .id
    }

    fn restored(outcome: RestoreOutcome) -> RestoreReport {
        match outcome {
            RestoreOutcome::Restored(report) => report,
            RestoreOutcome::Cancelled => panic!("restore was cancelled"),
        }
    }

    #[tokio::test]
    async fn unknown_id_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let stack = stack(&config);
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let id = BackupId::parse("20200101_000000").unwrap();
        let err = manager
            .restore(&id, RestoreOptions::default(), &AssumeYes)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
        assert!(stack.calls().is_empty());
    }

    #[tokio::test]
    async fn set_without_database_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let stack = stack(&config);
        let id = backup(&stack, &config).await;
        fs::remove_file(ArtifactStore::new(config.backup_dir()).path(ArtifactKind::Database, &id)).unwrap();
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);
        let before = stack.calls().len();

        let err = manager
            .restore(&id, RestoreOptions::default(), &AssumeYes)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
        assert_eq!(stack.calls().len(), before);
    }

    #[tokio::test]
    async fn declined_confirmation_stops_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let stack = stack(&config);
        let id = backup(&stack, &config).await;
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let seen = std::cell::RefCell::new(String::new());
        let decline = |prompt: &str| {
            *seen.borrow_mut() = prompt.to_string();
            false
        };
        let outcome = manager
            .restore(&id, RestoreOptions::default(), &decline)
            .await
            .unwrap();

        assert!(matches!(outcome, RestoreOutcome::Cancelled));
        assert!(stack.destructive_calls().is_empty());
        assert!(seen.borrow().contains("Backup 20240301_120000"));
        assert_eq!(probe.checks(), 0);
    }

    #[tokio::test]
    async fn restore_brings_back_the_dumped_database() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let stack = stack(&config);
        let id = backup(&stack, &config).await;
        stack.set_database(b"rows written after the backup");
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let report = restored(
            manager
                .restore(&id, RestoreOptions::default(), &AssumeYes)
                .await
                .unwrap(),
        );

        assert_eq!(stack.database(), Some(b"rows at backup time".to_vec()));
        assert!(report.health.healthy);
        assert!(report.warnings.is_empty());
        assert!(!report.app_state_reimported);
        assert!(stack.imported_app_state().is_none());

        let calls = stack.calls();
        let stop = calls.iter().position(|c| matches!(c, Call::Stop(_))).unwrap();
        let drop = calls.iter().position(|c| c.program() == Some("dropdb")).unwrap();
        let load = calls.iter().position(|c| c.program() == Some("psql")).unwrap();
        let start = calls.iter().position(|c| matches!(c, Call::Start(_))).unwrap();
        assert!(stop < drop && drop < load && load < start);
        assert_eq!(
            calls[stop],
            Call::Stop(vec![
                "web".to_string(),
                "celery_worker".to_string(),
                "celery_beat".to_string(),
                "flower".to_string(),
            ])
        );
        let execs = stack.exec_commands();
        assert!(execs.iter().any(|c| c == "redis-cli FLUSHALL"));
        assert!(execs.iter().any(|c| c.contains("collectstatic")));
    }

    #[tokio::test]
    async fn media_is_replaced_wholesale() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let media = config.media_dir();
        fs::create_dir_all(media.join("products")).unwrap();
        fs::write(media.join("products/a.jpg"), "a").unwrap();
        let stack = stack(&config);
        let id = backup(&stack, &config).await;

        fs::write(media.join("products/a.jpg"), "changed").unwrap();
        fs::write(media.join("uploaded-later.jpg"), "new").unwrap();
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);
        let options = RestoreOptions {
            restore_media: true,
            restore_config: false,
        };

        let report = restored(manager.restore(&id, options, &AssumeYes).await.unwrap());
        assert!(report.media_restored);
        assert_eq!(fs::read_to_string(media.join("products/a.jpg")).unwrap(), "a");
        assert!(!media.join("uploaded-later.jpg").exists());
    }

    #[tokio::test]
    async fn config_is_overlaid_on_project_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        fs::write(tmp.path().join(".env"), "DEBUG=0").unwrap();
        let stack = stack(&config);
        let id = backup(&stack, &config).await;

        fs::write(tmp.path().join(".env"), "DEBUG=1").unwrap();
        fs::write(tmp.path().join("local.txt"), "keep").unwrap();
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);
        let options = RestoreOptions {
            restore_media: false,
            restore_config: true,
        };

        let report = restored(manager.restore(&id, options, &AssumeYes).await.unwrap());
        assert!(report.config_restored);
        assert_eq!(fs::read_to_string(tmp.path().join(".env")).unwrap(), "DEBUG=0");
        assert!(tmp.path().join("local.txt").exists());
    }

    #[tokio::test]
    async fn requested_but_absent_media_is_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let stack = stack(&config);
        let id = backup(&stack, &config).await;
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);
        let options = RestoreOptions {
            restore_media: true,
            restore_config: false,
        };

        let report = restored(manager.restore(&id, options, &AssumeYes).await.unwrap());
        assert!(!report.media_restored);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("media requested"));
    }

    #[tokio::test]
    async fn app_state_is_reimported_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        config.restore.reimport_app_state = true;
        let stack = stack(&config);
        let id = backup(&stack, &config).await;
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let report = restored(
            manager
                .restore(&id, RestoreOptions::default(), &AssumeYes)
                .await
                .unwrap(),
        );
        assert!(report.app_state_reimported);
        assert_eq!(
            stack.imported_app_state(),
            Some(b"[{\"model\": \"orders.order\"}]".to_vec())
        );
    }

    #[tokio::test]
    async fn unhealthy_stack_is_reported_not_rolled_back() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let stack = stack(&config);
        let id = backup(&stack, &config).await;
        let probe = ScriptedProbe::always(ProbeResult::Unhealthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let report = restored(
            manager
                .restore(&id, RestoreOptions::default(), &AssumeYes)
                .await
                .unwrap(),
        );
        assert!(!report.health.healthy);
        assert_eq!(probe.checks(), 3);
        assert_eq!(stack.database(), Some(b"rows at backup time".to_vec()));
        assert!(report.warnings[0].contains("not healthy"));
    }

    #[tokio::test]
    async fn failed_load_requires_manual_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let id = backup(&stack(&config), &config).await;
        let stack = stack(&config).fail_exec("psql");
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let err = manager
            .restore(&id, RestoreOptions::default(), &AssumeYes)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Restore { step: "load the dump", .. }));
        assert_eq!(err.class(), deckhand_core::FailureClass::FatalDuringMutation);
        assert!(!stack.calls().iter().any(|c| matches!(c, Call::Start(_))));
    }

    #[tokio::test]
    async fn failed_cache_flush_is_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let id = backup(&stack(&config), &config).await;
        let stack = stack(&config).fail_exec("FLUSHALL");
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let report = restored(
            manager
                .restore(&id, RestoreOptions::default(), &AssumeYes)
                .await
                .unwrap(),
        );
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("cache flush failed"));
    }

    #[tokio::test]
    async fn list_sets_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let stack = stack(&config).fail_op(Op::Status);
        let backups = BackupManager::new(&stack, &config);
        for id in ["20240101_000000", "20240301_000000", "20240201_000000"] {
            backups
                .create_backup_with_id(BackupId::parse(id).unwrap())
                .await
                .unwrap();
        }
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let manager = RestoreManager::new(&stack, &probe, &config);

        let ids: Vec<String> = manager
            .list_available()
            .unwrap()
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, ["20240301_000000", "20240201_000000", "20240101_000000"]);
        assert!(manager.list_sets().unwrap().iter().all(BackupSet::is_restorable));
    }
}
