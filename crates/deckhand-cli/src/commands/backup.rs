use deckhand_backup::manifest::human_size;
use deckhand_backup::{ArtifactStore, BackupManager};
use deckhand_control::ComposeControlPlane;
use deckhand_core::{ArtifactKind, DeckhandConfig};

pub async fn create(config: &DeckhandConfig) -> anyhow::Result<i32> {
    let plane = ComposeControlPlane::from_config(&config.project);
    let manager = BackupManager::new(&plane, config);

    let report = manager.create_backup().await?;
    println!("✓ Backup {} ({})", report.id, human_size(report.set.total_size()));
    for kind in ArtifactKind::ALL {
        match report.set.artifact(kind) {
            Some(entry) if entry.present => {
                println!("  {kind:<9} {}", entry.path.display());
            }
            _ => println!("  {kind:<9} -"),
        }
    }
    for warning in &report.warnings {
        println!("  ! {warning}");
    }
    Ok(0)
}

pub fn list(config: &DeckhandConfig) -> anyhow::Result<i32> {
    let store = ArtifactStore::new(config.backup_dir());
    let ids = store.list_ids()?;
    if ids.is_empty() {
        println!("No backups in {}", store.dir().display());
        return Ok(0);
    }

    println!("{:<17} {:<10} {:>10}  contents", "id", "restorable", "size");
    for id in ids {
        let set = store.load(&id)?;
        let contents: Vec<&str> = ArtifactKind::ALL
            .into_iter()
            .filter(|k| set.is_present(*k))
            .map(ArtifactKind::prefix)
            .collect();
        println!(
            "{:<17} {:<10} {:>10}  {}",
            id,
            if set.is_restorable() { "yes" } else { "no" },
            human_size(set.total_size()),
            contents.join(", ")
        );
    }
    Ok(0)
}

pub fn prune(config: &DeckhandConfig, days: Option<u32>) -> anyhow::Result<i32> {
    let days = days.unwrap_or(config.backup.retention_days);
    let plane = ComposeControlPlane::from_config(&config.project);
    let report = BackupManager::new(&plane, config).prune_old_backups(days)?;

    for path in &report.removed {
        println!("  removed {}", path.display());
    }
    println!(
        "✓ Pruned {} file(s) older than {days} days, {} kept",
        report.removed.len(),
        report.kept
    );
    Ok(0)
}
