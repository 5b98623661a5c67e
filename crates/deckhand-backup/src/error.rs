//! Error types for backup and restore.

use std::path::PathBuf;

use thiserror::Error;

use deckhand_control::ControlError;
use deckhand_core::FailureClass;

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup {0} not found or has no database artifact")]
    NotFound(String),

    #[error("backup id {0} already exists")]
    IdCollision(String),

    #[error("database dump failed: {0}")]
    Dump(#[source] ControlError),

    #[error("restore of {id} failed while trying to {step}: {reason}; manual recovery required")]
    Restore {
        id: String,
        step: &'static str,
        reason: String,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BackupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }

    /// How far this failure reaches into the stack.
    pub fn class(&self) -> FailureClass {
        match self {
            BackupError::Restore { .. } => FailureClass::FatalDuringMutation,
            _ => FailureClass::FatalPreflight,
        }
    }
}
