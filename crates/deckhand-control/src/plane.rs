//! The service control plane capability.
//!
//! deckhand never owns service instances; it asks the control plane to
//! change them and reads their state back. Everything that touches the
//! running stack goes through [`ServiceControlPlane`], which keeps the
//! backup, restore and rollout logic testable against a recording double.

use std::future::Future;

use crate::error::ControlResult;

/// Observed state of one named service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub name: String,
    /// Instances currently running.
    pub running_replicas: u32,
    /// Instances known to the control plane, running or not.
    pub total_replicas: u32,
    /// `None` when the service defines no health check.
    pub healthy: Option<bool>,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        self.running_replicas > 0
    }
}

/// How a scale request treats instances that already exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleOptions {
    /// Replace existing instances instead of keeping them alongside new ones.
    pub recreate_existing: bool,
    /// Leave dependent services untouched.
    pub no_deps: bool,
}

pub trait ServiceControlPlane: Send + Sync {
    /// Start (creating if needed) the given services.
    fn start(&self, services: &[String]) -> impl Future<Output = ControlResult<()>> + Send;

    /// Stop the given services, keeping their containers.
    fn stop(&self, services: &[String]) -> impl Future<Output = ControlResult<()>> + Send;

    /// Set the replica count of one service.
    fn scale(
        &self,
        service: &str,
        replicas: u32,
        options: ScaleOptions,
    ) -> impl Future<Output = ControlResult<()>> + Send;

    /// Run `command` inside a service, feeding `stdin` if given, and return
    /// its standard output.
    fn exec(
        &self,
        service: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> impl Future<Output = ControlResult<Vec<u8>>> + Send;

    /// State of every service the control plane knows about.
    fn status(&self) -> impl Future<Output = ControlResult<Vec<ServiceState>>> + Send;

    /// Refresh the deployable artifacts of the given services.
    fn build(&self, services: &[String]) -> impl Future<Output = ControlResult<()>> + Send;
}

/// Look up a service by name in a status report.
pub fn find_service<'a>(states: &'a [ServiceState], name: &str) -> Option<&'a ServiceState> {
    states.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str, running: u32) -> ServiceState {
        ServiceState {
            name: name.to_string(),
            running_replicas: running,
            total_replicas: running.max(1),
            healthy: None,
        }
    }

    #[test]
    fn running_means_at_least_one_replica() {
        assert!(state("web", 1).is_running());
        assert!(!state("web", 0).is_running());
    }

    #[test]
    fn find_service_by_name() {
        let states = vec![state("web", 2), state("db", 1)];
        assert_eq!(find_service(&states, "web").unwrap().running_replicas, 2);
        assert!(find_service(&states, "redis").is_none());
    }
}
