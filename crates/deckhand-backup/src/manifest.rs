//! Backup manifest rendering.
//!
//! The manifest is for operators reading the artifact directory: sizes of
//! what was written, the state of the stack at backup time, and a comment
//! block listing which kinds are present and why the others are not.

use std::fmt::Write;

use deckhand_control::ServiceState;
use deckhand_core::{ArtifactKind, BackupId};

/// What happened to one artifact kind during a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: ArtifactKind,
    /// File name and size when written.
    pub written: Option<(String, u64)>,
    /// Why the artifact is absent.
    pub absent_reason: Option<String>,
}

impl ManifestEntry {
    pub fn written(kind: ArtifactKind, file: String, size: u64) -> Self {
        Self {
            kind,
            written: Some((file, size)),
            absent_reason: None,
        }
    }

    pub fn absent(kind: ArtifactKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            written: None,
            absent_reason: Some(reason.into()),
        }
    }

    pub fn is_present(&self) -> bool {
        self.written.is_some()
    }
}

pub fn render(id: &BackupId, entries: &[ManifestEntry], status: Option<&[ServiceState]>) -> String {
    let mut out = String::new();
    let created = id
        .created_at()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // Writing to a String cannot fail.
    let _ = writeln!(out, "Backup {id}");
    let _ = writeln!(out, "Created: {created}");
    let _ = writeln!(out);
    let _ = writeln!(out, "Artifacts:");
    for entry in entries {
        match &entry.written {
            Some((file, size)) => {
                let _ = writeln!(out, "  {:<10} {:<40} {}", entry.kind, file, human_size(*size));
            }
            None => {
                let _ = writeln!(out, "  {:<10} (absent)", entry.kind);
            }
        }
    }
    let total: u64 = entries.iter().filter_map(|e| e.written.as_ref()).map(|(_, s)| *s).sum();
    let _ = writeln!(out, "  total      {}", human_size(total));

    let _ = writeln!(out);
    let _ = writeln!(out, "System status:");
    match status {
        Some(states) if !states.is_empty() => {
            for s in states {
                let health = match s.healthy {
                    Some(true) => "healthy",
                    Some(false) => "unhealthy",
                    None => "-",
                };
                let _ = writeln!(
                    out,
                    "  {:<16} {}/{} running  {}",
                    s.name, s.running_replicas, s.total_replicas, health
                );
            }
        }
        Some(_) => {
            let _ = writeln!(out, "  no services reported");
        }
        None => {
            let _ = writeln!(out, "  unavailable");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "# Contents");
    for entry in entries {
        if entry.is_present() {
            let _ = writeln!(out, "#   [x] {}", entry.kind);
        } else {
            let reason = entry.absent_reason.as_deref().unwrap_or("not created");
            let _ = writeln!(out, "#   [ ] {} - {reason}", entry.kind);
        }
    }
    let restorable = entries
        .iter()
        .any(|e| e.kind == ArtifactKind::Database && e.is_present());
    let _ = writeln!(out, "# Restorable: {}", if restorable { "yes" } else { "no" });
    out
}

/// Human-friendly byte count: `512 B`, `1.5 KiB`, `3.2 MiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
