//! deckhand-core — shared types and configuration for deckhand.
//!
//! Everything the backup, restore and rollout crates agree on lives here:
//! the fixed set of service roles, artifact kinds and their on-disk naming,
//! backup ids, retry policies and the failure taxonomy. Configuration is
//! read from `deckhand.toml`.

pub mod config;
pub mod types;

pub use config::{ConfigError, DeckhandConfig};
pub use types::*;
