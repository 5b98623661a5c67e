//! Domain types shared across deckhand crates.

use std::fmt;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Format of a backup id: local time with one-second granularity.
pub const BACKUP_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// The fixed roles a managed stack is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    /// Request-facing web tier. The only role that is scaled during a rollout.
    Web,
    /// Background job workers.
    Worker,
    /// Periodic task scheduler.
    Scheduler,
    /// Monitoring UI for the workers.
    Monitor,
    /// Relational datastore.
    Database,
    /// Shared cache and message broker.
    Cache,
    /// Reverse proxy in front of the web tier.
    Proxy,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 7] = [
        ServiceRole::Web,
        ServiceRole::Worker,
        ServiceRole::Scheduler,
        ServiceRole::Monitor,
        ServiceRole::Database,
        ServiceRole::Cache,
        ServiceRole::Proxy,
    ];

    /// Roles that process work off the request path.
    pub const BACKGROUND: [ServiceRole; 2] = [ServiceRole::Worker, ServiceRole::Scheduler];

    /// Roles stopped while a restore rewrites the datastore.
    pub const STOPPED_FOR_RESTORE: [ServiceRole; 4] = [
        ServiceRole::Web,
        ServiceRole::Worker,
        ServiceRole::Scheduler,
        ServiceRole::Monitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Web => "web",
            ServiceRole::Worker => "worker",
            ServiceRole::Scheduler => "scheduler",
            ServiceRole::Monitor => "monitor",
            ServiceRole::Database => "database",
            ServiceRole::Cache => "cache",
            ServiceRole::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Category of a backup artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Logical dump of the datastore. Mandatory for a restore.
    Database,
    /// Structured export of application records.
    AppState,
    /// Archive of the user-media directory.
    Media,
    /// Archive of configuration files.
    Config,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Database,
        ArtifactKind::AppState,
        ArtifactKind::Media,
        ArtifactKind::Config,
    ];

    /// File name prefix, also used as the display label.
    pub fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Database => "database",
            ArtifactKind::AppState => "appdata",
            ArtifactKind::Media => "media",
            ArtifactKind::Config => "config",
        }
    }

    /// File extension, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Database => "sql.gz",
            ArtifactKind::AppState => "json.gz",
            ArtifactKind::Media | ArtifactKind::Config => "tar.gz",
        }
    }

    /// `<prefix>_<id>.<ext>`
    pub fn file_name(self, id: &BackupId) -> String {
        format!("{}_{}.{}", self.prefix(), id, self.extension())
    }

    /// Whether a set without this artifact can still be restored.
    pub fn is_required(self) -> bool {
        self == ArtifactKind::Database
    }

    /// Recover the kind and id from an artifact file name.
    pub fn parse_file_name(name: &str) -> Option<(ArtifactKind, BackupId)> {
        ArtifactKind::ALL.into_iter().find_map(|kind| {
            let rest = name.strip_prefix(kind.prefix())?.strip_prefix('_')?;
            let id = rest.strip_suffix(kind.extension())?.strip_suffix('.')?;
            BackupId::parse(id).map(|id| (kind, id))
        })
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.prefix())
    }
}

/// Identifier of one backup set, shared by all of its files.
///
/// Ids are local timestamps with one-second granularity, so two backups
/// started within the same second produce the same id. What happens then
/// is governed by [`CollisionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(String);

impl BackupId {
    /// Id for the current local time.
    pub fn now() -> Self {
        Self(Local::now().format(BACKUP_ID_FORMAT).to_string())
    }

    /// Accepts only well-formed `YYYYMMDD_HHMMSS` ids.
    pub fn parse(s: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(s, BACKUP_ID_FORMAT)
            .ok()
            .map(|_| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time encoded in the id.
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, BACKUP_ID_FORMAT).ok()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// What to do when a new backup would reuse an existing id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Refuse to create the backup; nothing is written.
    #[default]
    Reject,
    /// Replace the existing files of that id once the new dump has been taken.
    Overwrite,
}

/// Bounded, fixed-interval retry policy for health polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts. Always at least one.
    pub attempts: u32,
    /// Think-time between two attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

/// Classification of a failure, deciding how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Nothing was mutated; the operation stopped before touching the stack.
    FatalPreflight,
    /// The stack was left partially changed and needs manual recovery.
    FatalDuringMutation,
    /// An optional backup artifact is missing; the operation still succeeds.
    DegradedArtifact,
    /// Health polling ran out of attempts.
    HealthCheckExhausted,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::FatalPreflight => "fatal (preflight)",
            FailureClass::FatalDuringMutation => "fatal (during mutation)",
            FailureClass::DegradedArtifact => "degraded artifact",
            FailureClass::HealthCheckExhausted => "health check exhausted",
        };
        f.pad(s)
    }
}
