//! deckhand-backup — point-in-time snapshots of the stack and restoring them.
//!
//! A backup set is a group of files in one artifact directory sharing a
//! timestamp id: a datastore dump (mandatory), an app-state export, a
//! media archive, a configuration archive and a plain-text manifest.
//! Optional pieces may be absent; a set is restorable as long as its
//! datastore dump exists.
//!
//! # Components
//!
//! - **`store`** — artifact directory layout, set discovery, retention pruning
//! - **`archive`** — gzip and tar.gz codecs for dumps and directories
//! - **`datastore`** — datastore and app-state adapters run inside services
//! - **`manifest`** — human-readable manifest rendering
//! - **`backup`** — `BackupManager`
//! - **`restore`** — `RestoreManager` and the confirmation capability

pub mod archive;
pub mod backup;
pub mod datastore;
pub mod error;
pub mod manifest;
pub mod restore;
pub mod store;

pub use backup::{BackupManager, BackupReport, Snapshotter};
pub use datastore::{AppStateStore, Datastore, ManagementAppState, PostgresDatastore};
pub use error::{BackupError, BackupResult};
pub use restore::{AssumeYes, Confirm, RestoreManager, RestoreOptions, RestoreOutcome, RestoreReport};
pub use store::{ArtifactEntry, ArtifactStore, BackupSet, PruneReport};
