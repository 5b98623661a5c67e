//! First-time bring-up of the whole stack.
//!
//! Unlike an update there is no previous version to fall back to, so every
//! failure, including an unhealthy stack at the end, fails the deploy.

use std::fmt;
use std::time::Instant;

use tracing::{info, warn};

use deckhand_backup::{Datastore, PostgresDatastore};
use deckhand_control::{HealthProbe, ServiceControlPlane, poll_until_healthy};
use deckhand_core::{DeckhandConfig, FailureClass, RetryPolicy, ServiceRole};

use crate::phase::{PhaseLog, PhaseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStep {
    Build,
    StartDatastore,
    WaitForDatastore,
    StartAll,
    Migrate,
    CollectStatic,
    HealthCheck,
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployStep::Build => "build",
            DeployStep::StartDatastore => "start-datastore",
            DeployStep::WaitForDatastore => "wait-datastore",
            DeployStep::StartAll => "start-all",
            DeployStep::Migrate => "migrate",
            DeployStep::CollectStatic => "collect-static",
            DeployStep::HealthCheck => "health-check",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub log: PhaseLog<DeployStep>,
    /// The step that failed and why.
    pub failure: Option<(DeployStep, String)>,
}

impl DeployReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { 0 } else { 1 }
    }
}

pub struct Deployer<'a, C, H, D = PostgresDatastore<'a, C>> {
    plane: &'a C,
    probe: &'a H,
    datastore: D,
    config: &'a DeckhandConfig,
}

impl<'a, C: ServiceControlPlane, H: HealthProbe> Deployer<'a, C, H> {
    pub fn new(plane: &'a C, probe: &'a H, config: &'a DeckhandConfig) -> Self {
        Self::with_datastore(plane, probe, PostgresDatastore::from_config(plane, config), config)
    }
}

impl<'a, C, H, D> Deployer<'a, C, H, D>
where
    C: ServiceControlPlane,
    H: HealthProbe,
    D: Datastore,
{
    pub fn with_datastore(plane: &'a C, probe: &'a H, datastore: D, config: &'a DeckhandConfig) -> Self {
        Self {
            plane,
            probe,
            datastore,
            config,
        }
    }

    pub async fn deploy(&self) -> DeployReport {
        let mut log = PhaseLog::default();
        let steps = [
            DeployStep::Build,
            DeployStep::StartDatastore,
            DeployStep::WaitForDatastore,
            DeployStep::StartAll,
            DeployStep::Migrate,
            DeployStep::CollectStatic,
            DeployStep::HealthCheck,
        ];

        info!("starting deploy");
        for step in steps {
            let started = Instant::now();
            let outcome = self.run_step(step).await;
            let elapsed = started.elapsed();
            match outcome {
                Ok(result) => {
                    info!(%step, ?elapsed, "deploy step finished");
                    log.push(step, result, elapsed);
                }
                Err((class, reason)) => {
                    warn!(%step, %reason, "deploy failed");
                    log.push(
                        step,
                        PhaseResult::Failed {
                            class,
                            reason: reason.clone(),
                        },
                        elapsed,
                    );
                    return DeployReport {
                        log,
                        failure: Some((step, reason)),
                    };
                }
            }
        }

        info!("deploy completed");
        DeployReport { log, failure: None }
    }

    async fn run_step(&self, step: DeployStep) -> Result<PhaseResult, (FailureClass, String)> {
        let services = &self.config.services;
        let fatal = |what: &str, e: deckhand_control::ControlError| {
            (FailureClass::FatalDuringMutation, format!("{what}: {e}"))
        };
        match step {
            DeployStep::Build if !self.config.rollout.build => {
                Ok(PhaseResult::Skipped("disabled in configuration".to_string()))
            }
            DeployStep::Build => self
                .plane
                .build(&services.all())
                .await
                .map(|()| PhaseResult::Ok)
                .map_err(|e| (FailureClass::FatalPreflight, format!("image build failed: {e}"))),
            DeployStep::StartDatastore => self
                .plane
                .start(&services.names(&[ServiceRole::Database, ServiceRole::Cache]))
                .await
                .map(|()| PhaseResult::Ok)
                .map_err(|e| fatal("starting datastore and cache failed", e)),
            DeployStep::WaitForDatastore => {
                let policy = self.config.deploy.datastore_ready.policy();
                if self.wait_for_datastore(policy).await {
                    Ok(PhaseResult::Ok)
                } else {
                    Err((
                        FailureClass::FatalDuringMutation,
                        format!("datastore not ready after {} attempts", policy.attempts),
                    ))
                }
            }
            DeployStep::StartAll => self
                .plane
                .start(&services.all())
                .await
                .map(|()| PhaseResult::Ok)
                .map_err(|e| fatal("starting services failed", e)),
            DeployStep::Migrate => self
                .exec_web(&self.config.commands.migrate)
                .await
                .map_err(|e| fatal("migrations failed", e)),
            DeployStep::CollectStatic => self
                .exec_web(&self.config.commands.collect_static)
                .await
                .map_err(|e| fatal("static asset collection failed", e)),
            DeployStep::HealthCheck => {
                let verdict = poll_until_healthy(
                    self.probe,
                    &self.config.rollout.health_endpoint,
                    self.config.rollout.probe_timeout(),
                    self.config.deploy.health.policy(),
                )
                .await;
                if verdict.healthy {
                    Ok(PhaseResult::Ok)
                } else {
                    Err((
                        FailureClass::HealthCheckExhausted,
                        format!("stack not healthy after {} attempts", verdict.attempts),
                    ))
                }
            }
        }
    }

    async fn exec_web(&self, command: &[String]) -> deckhand_control::ControlResult<PhaseResult> {
        let web = self.config.services.name(ServiceRole::Web);
        self.plane.exec(web, command, None).await.map(|_| PhaseResult::Ok)
    }

    async fn wait_for_datastore(&self, policy: RetryPolicy) -> bool {
        for attempt in 1..=policy.attempts {
            if self.datastore.ping().await {
                info!(attempt, "datastore accepting connections");
                return true;
            }
            warn!(attempt, max_attempts = policy.attempts, "datastore not ready");
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        false
    }
}
