use std::io::{self, BufRead, Write};

use anyhow::Context;

use deckhand_backup::{AssumeYes, Confirm, RestoreManager, RestoreOptions, RestoreOutcome};
use deckhand_control::{ComposeControlPlane, HealthProbe, HttpProbe, ServiceControlPlane};
use deckhand_core::{BackupId, DeckhandConfig};

/// Asks on the terminal. Anything but `y`/`yes` declines, including EOF.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        println!("{prompt}");
        print!("Continue? [y/N] ");
        let _ = io::stdout().flush();
        read_answer(io::stdin().lock())
    }
}

fn read_answer(mut input: impl BufRead) -> bool {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
    }
}

pub async fn restore(
    config: &DeckhandConfig,
    id: &str,
    options: RestoreOptions,
    yes: bool,
) -> anyhow::Result<i32> {
    let id = BackupId::parse(id)
        .with_context(|| format!("invalid backup id {id:?}, expected YYYYMMDD_HHMMSS"))?;
    let plane = ComposeControlPlane::from_config(&config.project);
    let probe = HttpProbe;
    if yes {
        restore_with(&plane, &probe, config, &id, options, &AssumeYes).await
    } else {
        restore_with(&plane, &probe, config, &id, options, &StdinConfirm).await
    }
}

async fn restore_with<C, H, F>(
    plane: &C,
    probe: &H,
    config: &DeckhandConfig,
    id: &BackupId,
    options: RestoreOptions,
    confirm: &F,
) -> anyhow::Result<i32>
where
    C: ServiceControlPlane,
    H: HealthProbe,
    F: Confirm,
{
    let manager = RestoreManager::new(plane, probe, config);
    let outcome = manager.restore(id, options, confirm).await?;

    match outcome {
        RestoreOutcome::Cancelled => {
            println!("Restore cancelled, nothing was changed.");
        }
        RestoreOutcome::Restored(report) => {
            println!("✓ Restored backup {}", report.id);
            if report.media_restored {
                println!("  media replaced");
            }
            if report.config_restored {
                println!("  configuration restored");
            }
            if report.app_state_reimported {
                println!("  app state re-imported");
            }
            for warning in &report.warnings {
                println!("  ! {warning}");
            }
            if !report.health.healthy {
                println!("  ! check the stack, the health endpoint is not answering");
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use deckhand_backup::BackupManager;
    use deckhand_control::ProbeResult;
    use deckhand_control::testing::{FakeStack, ScriptedProbe};

    #[tokio::test]
    async fn declined_restore_exits_zero_and_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = DeckhandConfig::default();
        config.project.dir = tmp.path().to_path_buf();
        let stack = FakeStack::running(&config.services.all()).with_database(b"rows at backup time");
        let id = BackupManager::new(&stack, &config).create_backup().await.unwrap().id;
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let decline = |_: &str| false;

        let code = restore_with(&stack, &probe, &config, &id, RestoreOptions::default(), &decline)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(stack.destructive_calls().is_empty());
        assert_eq!(probe.checks(), 0);
    }

    #[test]
    fn only_yes_confirms() {
        assert!(read_answer("y\n".as_bytes()));
        assert!(read_answer("YES\n".as_bytes()));
        assert!(!read_answer("n\n".as_bytes()));
        assert!(!read_answer("\n".as_bytes()));
        assert!(!read_answer("".as_bytes()));
    }
}
