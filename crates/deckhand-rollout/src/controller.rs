//! Rollout controller — drives a zero-downtime update of the web tier.
//!
//! One extra web replica is started on the new image next to the running
//! ones and must pass the health gate before the tier is scaled back to
//! its steady count. Until the gate passes the update is reversible by
//! scaling back; after promotion a failure needs an operator.
//!
//! The controller never returns an error: every failure ends up in the
//! attempt's phase log and outcome.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use deckhand_backup::Snapshotter;
use deckhand_control::{
    HealthProbe, ScaleOptions, ServiceControlPlane, find_service, poll_until_healthy,
};
use deckhand_core::{BackupId, DeckhandConfig, FailureClass, RetryPolicy, ServiceRole};

use crate::phase::{PhaseLog, PhaseResult, RolloutPhase};

/// Operator switches for one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub skip_backup: bool,
    pub skip_migrations: bool,
    /// Do not start linked services when scaling.
    pub no_deps: bool,
    pub skip_build: bool,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New version serving. A failed final verification is only a warning.
    Completed { final_verify_healthy: bool },
    /// The new replica never became healthy; the web tier was scaled back.
    RolledBack { reason: String },
    Aborted {
        at: RolloutPhase,
        reason: String,
        /// The stack was already changed and is not reverted automatically.
        manual_intervention: bool,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

#[derive(Debug, Clone)]
struct Failure {
    at: RolloutPhase,
    reason: String,
    manual_intervention: bool,
}

/// State of one update, from preflight to a terminal phase. Never persisted.
#[derive(Debug, Clone)]
pub struct DeploymentAttempt {
    /// Web replicas observed before anything changed.
    pub pre_steady_replicas: u32,
    pub backup_id: Option<BackupId>,
    pub phase: RolloutPhase,
    /// Probes spent in the health gate.
    pub health_attempts: u32,
    pub outcome: Option<Outcome>,
    pub log: PhaseLog,
    failure: Option<Failure>,
    final_verify_healthy: bool,
}

impl DeploymentAttempt {
    fn new(steady_replicas: u32) -> Self {
        Self {
            pre_steady_replicas: steady_replicas,
            backup_id: None,
            phase: RolloutPhase::Preflight,
            health_attempts: 0,
            outcome: None,
            log: PhaseLog::default(),
            failure: None,
            final_verify_healthy: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: RolloutPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        debug!(from = %self.phase, to = %next, "phase transition");
        self.phase = next;
        true
    }
}

/// What a phase handler decided.
struct Step {
    result: PhaseResult,
    next: Option<RolloutPhase>,
}

impl Step {
    fn ok(next: RolloutPhase) -> Self {
        Self {
            result: PhaseResult::Ok,
            next: Some(next),
        }
    }

    fn skipped(reason: &str, next: RolloutPhase) -> Self {
        Self {
            result: PhaseResult::Skipped(reason.to_string()),
            next: Some(next),
        }
    }

    fn terminal(result: PhaseResult) -> Self {
        Self { result, next: None }
    }
}

pub struct RolloutController<'a, C, H, B> {
    plane: &'a C,
    probe: &'a H,
    backups: &'a B,
    config: &'a DeckhandConfig,
    options: UpdateOptions,
}

impl<'a, C, H, B> RolloutController<'a, C, H, B>
where
    C: ServiceControlPlane,
    H: HealthProbe,
    B: Snapshotter,
{
    pub fn new(
        plane: &'a C,
        probe: &'a H,
        backups: &'a B,
        config: &'a DeckhandConfig,
        options: UpdateOptions,
    ) -> Self {
        Self {
            plane,
            probe,
            backups,
            config,
            options,
        }
    }

    /// A fresh attempt positioned at preflight.
    pub fn begin(&self) -> DeploymentAttempt {
        DeploymentAttempt::new(self.config.rollout.steady_replicas)
    }

    /// Run an attempt from preflight to its outcome.
    pub async fn run(&self) -> DeploymentAttempt {
        let mut attempt = self.begin();
        info!(options = ?self.options, "starting rolling update");
        while !attempt.is_finished() {
            self.step(&mut attempt).await;
        }
        attempt
    }

    /// Execute exactly one phase of `attempt`.
    pub async fn step(&self, attempt: &mut DeploymentAttempt) {
        if attempt.is_finished() {
            return;
        }
        let phase = attempt.phase;
        let started = Instant::now();
        info!(%phase, "phase started");

        let step = match phase {
            RolloutPhase::Preflight => self.preflight(attempt).await,
            RolloutPhase::Backup => self.backup(attempt).await,
            RolloutPhase::Build => self.build(attempt).await,
            RolloutPhase::Migrate => self.migrate(attempt).await,
            RolloutPhase::ScaleOut => self.scale_out(attempt).await,
            RolloutPhase::HealthGate => self.health_gate(attempt).await,
            RolloutPhase::Promote => self.promote(attempt).await,
            RolloutPhase::WorkerRefresh => self.worker_refresh(attempt).await,
            RolloutPhase::CacheInvalidate => self.cache_invalidate(attempt).await,
            RolloutPhase::FinalVerify => self.final_verify(attempt).await,
            RolloutPhase::Done => self.done(attempt),
            RolloutPhase::Rollback => self.rollback(attempt).await,
            RolloutPhase::Abort => self.abort(attempt),
        };

        let elapsed = started.elapsed();
        match &step.result {
            PhaseResult::Failed { class, reason } => {
                warn!(%phase, %class, %reason, ?elapsed, "phase failed")
            }
            result => info!(%phase, %result, ?elapsed, "phase finished"),
        }
        attempt.log.push(phase, step.result, elapsed);

        if let Some(next) = step.next {
            if !attempt.transition(next) {
                error!(from = %phase, to = %next, "invalid phase transition");
                attempt.outcome = Some(Outcome::Aborted {
                    at: phase,
                    reason: format!("invalid transition from {phase} to {next}"),
                    manual_intervention: true,
                });
            }
        }
    }

    fn web(&self) -> &str {
        self.config.services.name(ServiceRole::Web)
    }

    fn scale_options(&self) -> ScaleOptions {
        ScaleOptions {
            recreate_existing: false,
            no_deps: self.options.no_deps,
        }
    }

    /// Record a failure and route to `next` (abort or rollback).
    fn fail(
        attempt: &mut DeploymentAttempt,
        class: FailureClass,
        reason: String,
        manual_intervention: bool,
        next: RolloutPhase,
    ) -> Step {
        attempt.failure = Some(Failure {
            at: attempt.phase,
            reason: reason.clone(),
            manual_intervention,
        });
        Step {
            result: PhaseResult::Failed { class, reason },
            next: Some(next),
        }
    }

    async fn preflight(&self, attempt: &mut DeploymentAttempt) -> Step {
        let states = match self.plane.status().await {
            Ok(states) => states,
            Err(e) => {
                return Self::fail(
                    attempt,
                    FailureClass::FatalPreflight,
                    format!("cannot read service status: {e}"),
                    false,
                    RolloutPhase::Abort,
                );
            }
        };

        let not_running: Vec<String> = self
            .config
            .services
            .all()
            .into_iter()
            .filter(|name| !find_service(&states, name).is_some_and(|s| s.is_running()))
            .collect();
        if !not_running.is_empty() {
            return Self::fail(
                attempt,
                FailureClass::FatalPreflight,
                format!("services not running: {}", not_running.join(", ")),
                false,
                RolloutPhase::Abort,
            );
        }

        attempt.pre_steady_replicas = find_service(&states, self.web())
            .map(|s| s.running_replicas)
            .filter(|n| *n > 0)
            .unwrap_or(self.config.rollout.steady_replicas);
        info!(
            web = %self.web(),
            replicas = attempt.pre_steady_replicas,
            "steady state recorded"
        );
        Step::ok(RolloutPhase::Backup)
    }

    async fn backup(&self, attempt: &mut DeploymentAttempt) -> Step {
        if self.options.skip_backup {
            return Step::skipped("--no-backup", RolloutPhase::Build);
        }
        match self.backups.snapshot().await {
            Ok(id) => {
                info!(%id, "pre-update backup taken");
                attempt.backup_id = Some(id);
                Step::ok(RolloutPhase::Build)
            }
            Err(e) => Self::fail(
                attempt,
                FailureClass::FatalPreflight,
                format!("backup failed: {e}"),
                false,
                RolloutPhase::Abort,
            ),
        }
    }

    async fn build(&self, attempt: &mut DeploymentAttempt) -> Step {
        if self.options.skip_build {
            return Step::skipped("--no-build", RolloutPhase::Migrate);
        }
        if !self.config.rollout.build {
            return Step::skipped("disabled in configuration", RolloutPhase::Migrate);
        }
        let services = self
            .config
            .services
            .names(&[ServiceRole::Web, ServiceRole::Worker, ServiceRole::Scheduler]);
        match self.plane.build(&services).await {
            Ok(()) => Step::ok(RolloutPhase::Migrate),
            Err(e) => Self::fail(
                attempt,
                FailureClass::FatalPreflight,
                format!("image build failed: {e}"),
                false,
                RolloutPhase::Abort,
            ),
        }
    }

    async fn migrate(&self, attempt: &mut DeploymentAttempt) -> Step {
        let mut commands = Vec::with_capacity(2);
        if !self.options.skip_migrations {
            commands.push(("migrations", &self.config.commands.migrate));
        }
        commands.push(("static assets", &self.config.commands.collect_static));

        for (what, command) in commands {
            if let Err(e) = self.plane.exec(self.web(), command, None).await {
                return Self::fail(
                    attempt,
                    FailureClass::FatalDuringMutation,
                    format!("{what} failed: {e}"),
                    true,
                    RolloutPhase::Abort,
                );
            }
            info!(service = %self.web(), "{what} applied");
        }

        if self.options.skip_migrations {
            Step::skipped("--no-migrations, static assets collected", RolloutPhase::ScaleOut)
        } else {
            Step::ok(RolloutPhase::ScaleOut)
        }
    }

    async fn scale_out(&self, attempt: &mut DeploymentAttempt) -> Step {
        let target = attempt.pre_steady_replicas + 1;
        match self.plane.scale(self.web(), target, self.scale_options()).await {
            Ok(()) => {
                info!(web = %self.web(), replicas = target, "new replica started");
                Step::ok(RolloutPhase::HealthGate)
            }
            Err(e) => Self::fail(
                attempt,
                FailureClass::FatalDuringMutation,
                format!("scale out to {target} failed: {e}"),
                false,
                RolloutPhase::Rollback,
            ),
        }
    }

    async fn health_gate(&self, attempt: &mut DeploymentAttempt) -> Step {
        let policy = self.config.rollout.health_gate.policy();
        let verdict = self.poll(policy).await;
        attempt.health_attempts = verdict.attempts;
        if verdict.healthy {
            Step::ok(RolloutPhase::Promote)
        } else {
            Self::fail(
                attempt,
                FailureClass::HealthCheckExhausted,
                format!("new replica not healthy after {} attempts", verdict.attempts),
                false,
                RolloutPhase::Rollback,
            )
        }
    }

    async fn promote(&self, attempt: &mut DeploymentAttempt) -> Step {
        let target = attempt.pre_steady_replicas;
        match self.plane.scale(self.web(), target, self.scale_options()).await {
            Ok(()) => Step::ok(RolloutPhase::WorkerRefresh),
            Err(e) => Self::fail(
                attempt,
                FailureClass::FatalDuringMutation,
                format!("scale back to {target} failed: {e}"),
                true,
                RolloutPhase::Abort,
            ),
        }
    }

    async fn worker_refresh(&self, attempt: &mut DeploymentAttempt) -> Step {
        let workers = self.config.services.names(&ServiceRole::BACKGROUND);
        let result = match self.plane.stop(&workers).await {
            Ok(()) => self.plane.start(&workers).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Step::ok(RolloutPhase::CacheInvalidate),
            Err(e) => Self::fail(
                attempt,
                FailureClass::FatalDuringMutation,
                format!("worker restart failed: {e}"),
                true,
                RolloutPhase::Abort,
            ),
        }
    }

    async fn cache_invalidate(&self, attempt: &mut DeploymentAttempt) -> Step {
        let cache = self.config.services.name(ServiceRole::Cache);
        match self.plane.exec(cache, &self.config.commands.flush_cache, None).await {
            Ok(_) => Step::ok(RolloutPhase::FinalVerify),
            Err(e) => Self::fail(
                attempt,
                FailureClass::FatalDuringMutation,
                format!("cache flush failed: {e}"),
                true,
                RolloutPhase::Abort,
            ),
        }
    }

    async fn final_verify(&self, attempt: &mut DeploymentAttempt) -> Step {
        let verdict = self.poll(self.config.rollout.final_verify.policy()).await;
        attempt.final_verify_healthy = verdict.healthy;
        let result = if verdict.healthy {
            PhaseResult::Ok
        } else {
            PhaseResult::Warned(format!(
                "stack not healthy after {} attempts",
                verdict.attempts
            ))
        };
        Step {
            result,
            next: Some(RolloutPhase::Done),
        }
    }

    fn done(&self, attempt: &mut DeploymentAttempt) -> Step {
        info!(
            backup = ?attempt.backup_id.as_ref().map(BackupId::as_str),
            healthy = attempt.final_verify_healthy,
            "rolling update completed"
        );
        attempt.outcome = Some(Outcome::Completed {
            final_verify_healthy: attempt.final_verify_healthy,
        });
        Step::terminal(PhaseResult::Ok)
    }

    async fn rollback(&self, attempt: &mut DeploymentAttempt) -> Step {
        let reason = attempt
            .failure
            .as_ref()
            .map(|f| f.reason.clone())
            .unwrap_or_else(|| "rollback requested".to_string());
        let target = attempt.pre_steady_replicas;
        warn!(web = %self.web(), replicas = target, %reason, "rolling back");

        match self.plane.scale(self.web(), target, self.scale_options()).await {
            Ok(()) => {
                attempt.outcome = Some(Outcome::RolledBack { reason });
                Step::terminal(PhaseResult::Ok)
            }
            Err(e) => {
                let failed = format!("scale back to {target} failed: {e}");
                error!(%failed, "rollback failed");
                attempt.outcome = Some(Outcome::Aborted {
                    at: RolloutPhase::Rollback,
                    reason: format!("{reason}; {failed}"),
                    manual_intervention: true,
                });
                Step::terminal(PhaseResult::Failed {
                    class: FailureClass::FatalDuringMutation,
                    reason: failed,
                })
            }
        }
    }

    fn abort(&self, attempt: &mut DeploymentAttempt) -> Step {
        let failure = attempt.failure.take().unwrap_or(Failure {
            at: RolloutPhase::Abort,
            reason: "aborted".to_string(),
            manual_intervention: false,
        });
        if failure.manual_intervention {
            error!(at = %failure.at, reason = %failure.reason, "update aborted mid-change, manual intervention required");
        } else {
            warn!(at = %failure.at, reason = %failure.reason, "update aborted, stack unchanged");
        }
        attempt.outcome = Some(Outcome::Aborted {
            at: failure.at,
            reason: failure.reason,
            manual_intervention: failure.manual_intervention,
        });
        Step::terminal(PhaseResult::Ok)
    }

    async fn poll(&self, policy: RetryPolicy) -> deckhand_control::HealthVerdict {
        poll_until_healthy(
            self.probe,
            &self.config.rollout.health_endpoint,
            self.config.rollout.probe_timeout(),
            policy,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use deckhand_backup::BackupManager;
    use deckhand_control::ProbeResult;
    use deckhand_control::testing::{Call, FakeStack, Op, ScriptedProbe};

    fn config(root: &std::path::Path) -> DeckhandConfig {
        let mut config = DeckhandConfig::default();
        config.project.dir = root.to_path_buf();
        config.rollout.health_gate.interval = "0s".to_string();
        config.rollout.final_verify.interval = "0s".to_string();
        config
    }

    fn stack(config: &DeckhandConfig) -> FakeStack {
        FakeStack::running(&config.services.all()).with_database(b"rows")
    }

    fn web_scales(stack: &FakeStack) -> Vec<(u32, bool)> {
        stack
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Scale {
                    service,
                    replicas,
                    options,
                } if service == "web" => Some((replicas, options.recreate_existing)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn healthy_update_scales_out_then_back() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config);
        let probe = ScriptedProbe::healthy_on_attempt(2);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        assert_eq!(
            attempt.outcome,
            Some(Outcome::Completed {
                final_verify_healthy: true
            })
        );
        assert_eq!(attempt.outcome.as_ref().unwrap().exit_code(), 0);
        assert_eq!(attempt.pre_steady_replicas, 1);
        assert_eq!(attempt.health_attempts, 2);
        assert!(attempt.backup_id.is_some());
        assert_eq!(web_scales(&stack), vec![(2, false), (1, false)]);
        assert_eq!(stack.running_replicas("web"), 1);
        assert_eq!(
            attempt.log.phases(),
            vec![
                RolloutPhase::Preflight,
                RolloutPhase::Backup,
                RolloutPhase::Build,
                RolloutPhase::Migrate,
                RolloutPhase::ScaleOut,
                RolloutPhase::HealthGate,
                RolloutPhase::Promote,
                RolloutPhase::WorkerRefresh,
                RolloutPhase::CacheInvalidate,
                RolloutPhase::FinalVerify,
                RolloutPhase::Done,
            ]
        );
        assert!(stack.calls().contains(&Call::Stop(vec![
            "celery_worker".to_string(),
            "celery_beat".to_string()
        ])));
    }

    #[tokio::test]
    async fn exhausted_health_gate_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config);
        let probe = ScriptedProbe::always(ProbeResult::Unhealthy);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        assert!(matches!(attempt.outcome, Some(Outcome::RolledBack { .. })));
        assert_eq!(attempt.outcome.as_ref().unwrap().exit_code(), 1);
        assert_eq!(attempt.health_attempts, 5);
        assert_eq!(probe.checks(), 5);
        assert_eq!(web_scales(&stack), vec![(2, false), (1, false)]);
        assert_eq!(stack.running_replicas("web"), 1);
        assert!(!attempt.log.ran(RolloutPhase::Promote));
        assert!(!attempt.log.ran(RolloutPhase::WorkerRefresh));
        assert!(!attempt.log.ran(RolloutPhase::CacheInvalidate));
        assert!(!attempt.log.ran(RolloutPhase::FinalVerify));
        assert!(!stack.calls().iter().any(|c| matches!(c, Call::Stop(_))));
        assert!(!stack.exec_commands().iter().any(|c| c.contains("FLUSHALL")));
        assert_eq!(attempt.phase, RolloutPhase::Rollback);
    }

    #[tokio::test]
    async fn rollback_restores_observed_replica_count() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config).with_replicas("web", 3);
        let probe = ScriptedProbe::always(ProbeResult::Failed);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        assert_eq!(attempt.pre_steady_replicas, 3);
        assert_eq!(web_scales(&stack), vec![(4, false), (3, false)]);
        assert_eq!(stack.running_replicas("web"), 3);
    }

    #[tokio::test]
    async fn failed_migration_never_scales() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config).fail_exec("migrate");
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        match attempt.outcome {
            Some(Outcome::Aborted {
                at,
                manual_intervention,
                ..
            }) => {
                assert_eq!(at, RolloutPhase::Migrate);
                assert!(manual_intervention);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(web_scales(&stack).is_empty());
        assert!(!attempt.log.ran(RolloutPhase::ScaleOut));
        assert!(attempt.backup_id.is_some());
        assert_eq!(probe.checks(), 0);
    }

    #[tokio::test]
    async fn preflight_abort_takes_no_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = FakeStack::running(&["web", "db"]);
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        match &attempt.outcome {
            Some(Outcome::Aborted {
                at,
                reason,
                manual_intervention,
            }) => {
                assert_eq!(*at, RolloutPhase::Preflight);
                assert!(reason.contains("celery_worker"));
                assert!(!manual_intervention);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(stack.calls(), vec![Call::Status]);
        assert!(backups.store().list_ids().unwrap().is_empty());
        assert!(attempt.backup_id.is_none());
    }

    #[tokio::test]
    async fn failed_backup_aborts_before_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config).fail_exec("pg_dump");
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        assert!(matches!(
            attempt.outcome,
            Some(Outcome::Aborted {
                at: RolloutPhase::Backup,
                manual_intervention: false,
                ..
            })
        ));
        assert!(stack.destructive_calls().is_empty());
        assert!(!stack.calls().iter().any(|c| matches!(c, Call::Build(_))));
    }

    #[tokio::test]
    async fn failed_final_verify_still_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config);
        // Healthy once for the gate, failing afterwards.
        let probe = ScriptedProbe::new(vec![ProbeResult::Healthy]);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        assert_eq!(
            attempt.outcome,
            Some(Outcome::Completed {
                final_verify_healthy: false
            })
        );
        assert_eq!(probe.checks(), 4);
        assert!(matches!(
            attempt.log.result_of(RolloutPhase::FinalVerify),
            Some(PhaseResult::Warned(_))
        ));
    }

    #[tokio::test]
    async fn skip_switches_are_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config);
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let backups = BackupManager::new(&stack, &config);
        let options = UpdateOptions {
            skip_backup: true,
            skip_migrations: true,
            no_deps: true,
            skip_build: true,
        };
        let controller = RolloutController::new(&stack, &probe, &backups, &config, options);

        let attempt = controller.run().await;

        assert!(attempt.outcome.as_ref().unwrap().is_success());
        assert!(attempt.backup_id.is_none());
        assert!(matches!(
            attempt.log.result_of(RolloutPhase::Backup),
            Some(PhaseResult::Skipped(_))
        ));
        let execs = stack.exec_commands();
        assert!(!execs.iter().any(|c| c.contains("migrate")));
        assert!(execs.iter().any(|c| c.contains("collectstatic")));
        assert!(!execs.iter().any(|c| c.starts_with("pg_dump")));
        assert!(!stack.calls().iter().any(|c| matches!(c, Call::Build(_))));
        assert!(stack.calls().iter().all(|c| match c {
            Call::Scale { options, .. } => options.no_deps,
            _ => true,
        }));
    }

    #[tokio::test]
    async fn failed_scale_out_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config).fail_op(Op::Scale);
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let attempt = controller.run().await;

        assert_eq!(
            attempt.log.phases(),
            vec![
                RolloutPhase::Preflight,
                RolloutPhase::Backup,
                RolloutPhase::Build,
                RolloutPhase::Migrate,
                RolloutPhase::ScaleOut,
                RolloutPhase::Rollback,
            ]
        );
        // Scaling back failed too, so the operator has to step in.
        assert!(matches!(
            attempt.outcome,
            Some(Outcome::Aborted {
                at: RolloutPhase::Rollback,
                manual_intervention: true,
                ..
            })
        ));
        assert_eq!(probe.checks(), 0);
    }

    #[tokio::test]
    async fn step_executes_one_phase_at_a_time() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let stack = stack(&config);
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let backups = BackupManager::new(&stack, &config);
        let controller =
            RolloutController::new(&stack, &probe, &backups, &config, UpdateOptions::default());

        let mut attempt = controller.begin();
        assert_eq!(attempt.phase, RolloutPhase::Preflight);
        controller.step(&mut attempt).await;
        assert_eq!(attempt.phase, RolloutPhase::Backup);
        assert_eq!(stack.calls(), vec![Call::Status]);

        for _ in 0..3 {
            controller.step(&mut attempt).await;
        }
        assert_eq!(attempt.phase, RolloutPhase::ScaleOut);
        assert!(web_scales(&stack).is_empty());

        controller.step(&mut attempt).await;
        assert_eq!(attempt.phase, RolloutPhase::HealthGate);
        assert_eq!(stack.running_replicas("web"), 2);
        assert!(!attempt.is_finished());
    }

    #[test]
    fn attempt_rejects_invalid_transitions() {
        let mut attempt = DeploymentAttempt::new(1);
        assert!(!attempt.transition(RolloutPhase::ScaleOut));
        assert!(!attempt.transition(RolloutPhase::Rollback));
        assert_eq!(attempt.phase, RolloutPhase::Preflight);
        assert!(attempt.transition(RolloutPhase::Backup));
        assert_eq!(attempt.phase, RolloutPhase::Backup);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::Completed { final_verify_healthy: false }.exit_code(), 0);
        assert_eq!(Outcome::RolledBack { reason: "x".into() }.exit_code(), 1);
        let aborted = Outcome::Aborted {
            at: RolloutPhase::Migrate,
            reason: "x".into(),
            manual_intervention: true,
        };
        assert_eq!(aborted.exit_code(), 1);
    }
}
