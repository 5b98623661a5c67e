use deckhand_control::{ComposeControlPlane, HealthProbe, HttpProbe, ServiceControlPlane, find_service};
use deckhand_core::{DeckhandConfig, ServiceRole};

pub async fn status(config: &DeckhandConfig) -> anyhow::Result<i32> {
    let plane = ComposeControlPlane::from_config(&config.project);
    let states = plane.status().await?;

    println!("{:<10} {:<16} {:<9} health", "role", "service", "replicas");
    let mut all_running = true;
    for role in ServiceRole::ALL {
        let name = config.services.name(role);
        match find_service(&states, name) {
            Some(state) => {
                all_running &= state.is_running();
                let health = match state.healthy {
                    Some(true) => "healthy",
                    Some(false) => "unhealthy",
                    None => "-",
                };
                println!(
                    "{role:<10} {name:<16} {:<9} {health}",
                    format!("{}/{}", state.running_replicas, state.total_replicas)
                );
            }
            None => {
                all_running = false;
                println!("{role:<10} {name:<16} {:<9} -", "absent");
            }
        }
    }

    let endpoint = &config.rollout.health_endpoint;
    let probe = HttpProbe.check(endpoint, config.rollout.probe_timeout()).await;
    println!("\nEndpoint {endpoint}: {probe:?}");

    Ok(if all_running { 0 } else { 1 })
}
