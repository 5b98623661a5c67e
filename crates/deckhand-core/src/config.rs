//! deckhand.toml configuration parser.
//!
//! Every section and field has a default matching the stack deckhand was
//! built for, so an absent file or a file with only a few overrides is
//! valid. Durations are written the same way as health settings elsewhere:
//! `"10s"`, `"500ms"`, `"1m"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CollisionPolicy, RetryPolicy, ServiceRole};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "deckhand.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckhandConfig {
    pub project: ProjectConfig,
    pub services: ServicesConfig,
    pub datastore: DatastoreConfig,
    pub backup: BackupConfig,
    pub rollout: RolloutConfig,
    pub restore: RestoreConfig,
    pub deploy: DeployConfig,
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root of the deployed project. Relative paths elsewhere resolve here.
    pub dir: PathBuf,
    /// Program invoked for compose commands.
    pub compose_program: String,
    pub compose_file: Option<String>,
    pub project_name: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            compose_program: "docker".to_string(),
            compose_file: Some("docker-compose.yml".to_string()),
            project_name: None,
        }
    }
}

/// Compose service name for each role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub web: String,
    pub worker: String,
    pub scheduler: String,
    pub monitor: String,
    pub database: String,
    pub cache: String,
    pub proxy: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            web: "web".to_string(),
            worker: "celery_worker".to_string(),
            scheduler: "celery_beat".to_string(),
            monitor: "flower".to_string(),
            database: "db".to_string(),
            cache: "redis".to_string(),
            proxy: "nginx".to_string(),
        }
    }
}

impl ServicesConfig {
    pub fn name(&self, role: ServiceRole) -> &str {
        match role {
            ServiceRole::Web => &self.web,
            ServiceRole::Worker => &self.worker,
            ServiceRole::Scheduler => &self.scheduler,
            ServiceRole::Monitor => &self.monitor,
            ServiceRole::Database => &self.database,
            ServiceRole::Cache => &self.cache,
            ServiceRole::Proxy => &self.proxy,
        }
    }

    /// Service names for the given roles, in role order.
    pub fn names(&self, roles: &[ServiceRole]) -> Vec<String> {
        roles.iter().map(|r| self.name(*r).to_string()).collect()
    }

    /// Every steady-state service.
    pub fn all(&self) -> Vec<String> {
        self.names(&ServiceRole::ALL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Database name, dropped and recreated on restore.
    pub name: String,
    pub user: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            name: "order_fulfillment".to_string(),
            user: "postgres".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Artifact directory.
    pub dir: PathBuf,
    pub retention_days: u32,
    /// User-media directory, archived wholesale.
    pub media_dir: PathBuf,
    /// Configuration files archived when present, relative to the project dir.
    pub config_paths: Vec<PathBuf>,
    /// Record categories left out of the app-state export.
    pub app_state_exclude: Vec<String>,
    pub on_collision: CollisionPolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("backups"),
            retention_days: 30,
            media_dir: PathBuf::from("media"),
            config_paths: vec![
                PathBuf::from(".env"),
                PathBuf::from("docker-compose.yml"),
                PathBuf::from("nginx/nginx.conf"),
            ],
            app_state_exclude: vec![
                "contenttypes".to_string(),
                "auth.permission".to_string(),
                "admin.logentry".to_string(),
                "sessions.session".to_string(),
            ],
            on_collision: CollisionPolicy::Reject,
        }
    }
}

/// Attempt count and think-time, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub interval: String,
}

impl RetryConfig {
    fn new(attempts: u32, interval: &str) -> Self {
        Self {
            attempts,
            interval: interval.to_string(),
        }
    }

    /// Resolved policy. Call [`DeckhandConfig::validate`] first to reject
    /// unparseable intervals; here they fall back to zero.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.attempts,
            parse_duration(&self.interval).unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Web replicas expected in steady state.
    pub steady_replicas: u32,
    pub health_endpoint: String,
    pub probe_timeout: String,
    /// Run the BUILD phase.
    pub build: bool,
    pub health_gate: RetryConfig,
    pub final_verify: RetryConfig,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            steady_replicas: 1,
            health_endpoint: "http://localhost/health/".to_string(),
            probe_timeout: "10s".to_string(),
            build: true,
            health_gate: RetryConfig::new(5, "10s"),
            final_verify: RetryConfig::new(3, "5s"),
        }
    }
}

impl RolloutConfig {
    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Load the app-state export back after the dump has been restored.
    pub reimport_app_state: bool,
    pub health: RetryConfig,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            reimport_app_state: false,
            health: RetryConfig::new(3, "10s"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Polling for the datastore to accept connections after start.
    pub datastore_ready: RetryConfig,
    pub health: RetryConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            datastore_ready: RetryConfig::new(30, "2s"),
            health: RetryConfig::new(3, "10s"),
        }
    }
}

/// Commands run inside services. Each is an argv, not a shell string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub migrate: Vec<String>,
    pub collect_static: Vec<String>,
    pub flush_cache: Vec<String>,
    pub app_state_export: Vec<String>,
    pub app_state_import: Vec<String>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            migrate: argv(&["python", "manage.py", "migrate", "--noinput"]),
            collect_static: argv(&["python", "manage.py", "collectstatic", "--noinput"]),
            flush_cache: argv(&["redis-cli", "FLUSHALL"]),
            app_state_export: argv(&[
                "python",
                "manage.py",
                "dumpdata",
                "--natural-foreign",
                "--natural-primary",
                "--indent",
                "2",
            ]),
            app_state_import: argv(&["python", "manage.py", "loaddata", "--format=json", "-"]),
        }
    }
}

impl DeckhandConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DeckhandConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if it exists, otherwise use the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let retries = [
            ("rollout.health_gate", &self.rollout.health_gate),
            ("rollout.final_verify", &self.rollout.final_verify),
            ("restore.health", &self.restore.health),
            ("deploy.datastore_ready", &self.deploy.datastore_ready),
            ("deploy.health", &self.deploy.health),
        ];
        for (key, retry) in retries {
            if retry.attempts == 0 {
                return Err(ConfigError::Invalid(format!("{key}.attempts must be at least 1")));
            }
            if parse_duration(&retry.interval).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{key}.interval: cannot parse {:?}",
                    retry.interval
                )));
            }
        }
        if parse_duration(&self.rollout.probe_timeout).is_none() {
            return Err(ConfigError::Invalid(format!(
                "rollout.probe_timeout: cannot parse {:?}",
                self.rollout.probe_timeout
            )));
        }
        if self.rollout.steady_replicas == 0 {
            return Err(ConfigError::Invalid(
                "rollout.steady_replicas must be at least 1".to_string(),
            ));
        }
        for role in ServiceRole::ALL {
            if self.services.name(role).trim().is_empty() {
                return Err(ConfigError::Invalid(format!("services.{role} is empty")));
            }
        }
        let commands = [
            ("commands.migrate", &self.commands.migrate),
            ("commands.collect_static", &self.commands.collect_static),
            ("commands.flush_cache", &self.commands.flush_cache),
            ("commands.app_state_export", &self.commands.app_state_export),
            ("commands.app_state_import", &self.commands.app_state_import),
        ];
        for (key, cmd) in commands {
            if cmd.is_empty() {
                return Err(ConfigError::Invalid(format!("{key} is empty")));
            }
        }
        Ok(())
    }

    /// Resolve a possibly relative path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project.dir.join(path)
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.backup.dir)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.resolve(&self.backup.media_dir)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
