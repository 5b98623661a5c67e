use deckhand_backup::BackupManager;
use deckhand_control::{ComposeControlPlane, HttpProbe};
use deckhand_core::DeckhandConfig;
use deckhand_rollout::{Deployer, Outcome, RolloutController, UpdateOptions};

/// Run a rolling update and print its phase log. Returns the exit code.
pub async fn update(config: &DeckhandConfig, options: UpdateOptions) -> i32 {
    let plane = ComposeControlPlane::from_config(&config.project);
    let probe = HttpProbe;
    let backups = BackupManager::new(&plane, config);
    let controller = RolloutController::new(&plane, &probe, &backups, config, options);

    let attempt = controller.run().await;
    print!("{}", attempt.log);
    if let Some(id) = &attempt.backup_id {
        println!("Backup: {id}");
    }

    match &attempt.outcome {
        Some(Outcome::Completed { final_verify_healthy }) => {
            println!("✓ Update completed");
            if !final_verify_healthy {
                println!("  ! final verification failed, check the stack");
            }
        }
        Some(Outcome::RolledBack { reason }) => {
            println!(
                "✗ Update rolled back to {} web replica(s): {reason}",
                attempt.pre_steady_replicas
            );
        }
        Some(Outcome::Aborted {
            at,
            reason,
            manual_intervention,
        }) => {
            println!("✗ Update aborted at {at}: {reason}");
            if *manual_intervention {
                println!("  ! the stack was partially updated, manual intervention required");
            }
        }
        None => println!("✗ Update did not finish"),
    }
    attempt.outcome.as_ref().map_or(1, Outcome::exit_code)
}

pub async fn deploy(config: &DeckhandConfig) -> i32 {
    let plane = ComposeControlPlane::from_config(&config.project);
    let probe = HttpProbe;
    let report = Deployer::new(&plane, &probe, config).deploy().await;

    print!("{}", report.log);
    match &report.failure {
        None => println!("✓ Deploy completed"),
        Some((step, reason)) => println!("✗ Deploy failed at {step}: {reason}"),
    }
    report.exit_code()
}
