//! In-memory doubles for the control plane and health probe.
//!
//! [`FakeStack`] records every call and simulates just enough of a real
//! stack to exercise the managers end to end: replica counts per service,
//! a datastore whose contents follow `pg_dump`/`dropdb`/`createdb`/`psql`,
//! and an app-state export. Failures are injected per operation or per
//! exec command substring.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{ControlError, ControlResult};
use crate::health::{HealthProbe, ProbeResult};
use crate::plane::{ScaleOptions, ServiceControlPlane, ServiceState};

/// One recorded control plane call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(Vec<String>),
    Stop(Vec<String>),
    Scale {
        service: String,
        replicas: u32,
        options: ScaleOptions,
    },
    Exec {
        service: String,
        command: Vec<String>,
    },
    Status,
    Build(Vec<String>),
}

impl Call {
    /// Calls that change the stack or the datastore.
    pub fn is_destructive(&self) -> bool {
        match self {
            Call::Stop(_) | Call::Scale { .. } => true,
            Call::Exec { command, .. } => matches!(
                command.first().map(String::as_str),
                Some("dropdb" | "createdb" | "psql")
            ),
            _ => false,
        }
    }

    /// The exec'd program name, if this is an exec call.
    pub fn program(&self) -> Option<&str> {
        match self {
            Call::Exec { command, .. } => command.first().map(String::as_str),
            _ => None,
        }
    }
}

/// Non-exec operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Start,
    Stop,
    Scale,
    Status,
    Build,
}

#[derive(Debug, Default)]
struct FakeState {
    services: BTreeMap<String, ServiceState>,
    calls: Vec<Call>,
    database: Option<Vec<u8>>,
    app_state: Vec<u8>,
    imported_app_state: Option<Vec<u8>>,
    failing_ops: Vec<Op>,
    failing_exec: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeStack {
    inner: Mutex<FakeState>,
}

impl FakeStack {
    /// Every named service running with one replica, and an empty database.
    pub fn running<S: AsRef<str>>(services: &[S]) -> Self {
        let stack = Self::default();
        {
            let mut inner = stack.lock();
            for name in services {
                let name = name.as_ref().to_string();
                inner.services.insert(name.clone(), replicas(&name, 1));
            }
            inner.database = Some(Vec::new());
        }
        stack
    }

    pub fn with_database(self, contents: &[u8]) -> Self {
        self.lock().database = Some(contents.to_vec());
        self
    }

    pub fn with_app_state(self, export: &[u8]) -> Self {
        self.lock().app_state = export.to_vec();
        self
    }

    pub fn with_replicas(self, service: &str, count: u32) -> Self {
        self.lock()
            .services
            .insert(service.to_string(), replicas(service, count));
        self
    }

    /// Make every call of `op` fail.
    pub fn fail_op(self, op: Op) -> Self {
        self.lock().failing_ops.push(op);
        self
    }

    /// Make every exec whose joined command contains `pattern` fail.
    pub fn fail_exec(self, pattern: &str) -> Self {
        self.lock().failing_exec.push(pattern.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn destructive_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_destructive).collect()
    }

    /// Joined command lines of every exec call, in order.
    pub fn exec_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Exec { command, .. } => Some(command.join(" ")),
                _ => None,
            })
            .collect()
    }

    pub fn database(&self) -> Option<Vec<u8>> {
        self.lock().database.clone()
    }

    /// Mutate the simulated datastore without recording a call.
    pub fn set_database(&self, contents: &[u8]) {
        self.lock().database = Some(contents.to_vec());
    }

    pub fn imported_app_state(&self) -> Option<Vec<u8>> {
        self.lock().imported_app_state.clone()
    }

    pub fn running_replicas(&self, service: &str) -> u32 {
        self.lock()
            .services
            .get(service)
            .map(|s| s.running_replicas)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: Call, op: Option<Op>) -> ControlResult<std::sync::MutexGuard<'_, FakeState>> {
        let mut inner = self.lock();
        inner.calls.push(call);
        if let Some(op) = op {
            if inner.failing_ops.contains(&op) {
                return Err(injected(&format!("{op:?}")));
            }
        }
        Ok(inner)
    }
}

fn replicas(name: &str, count: u32) -> ServiceState {
    ServiceState {
        name: name.to_string(),
        running_replicas: count,
        total_replicas: count,
        healthy: None,
    }
}

fn injected(what: &str) -> ControlError {
    ControlError::CommandFailed {
        command: what.to_string(),
        status: "exit status: 1".to_string(),
        stderr: "injected failure".to_string(),
    }
}

impl ServiceControlPlane for FakeStack {
    async fn start(&self, services: &[String]) -> ControlResult<()> {
        let mut inner = self.record(Call::Start(services.to_vec()), Some(Op::Start))?;
        for name in services {
            let state = inner
                .services
                .entry(name.clone())
                .or_insert_with(|| replicas(name, 0));
            state.total_replicas = state.total_replicas.max(1);
            state.running_replicas = state.total_replicas;
        }
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> ControlResult<()> {
        let mut inner = self.record(Call::Stop(services.to_vec()), Some(Op::Stop))?;
        for name in services {
            if let Some(state) = inner.services.get_mut(name) {
                state.running_replicas = 0;
            }
        }
        Ok(())
    }

    async fn scale(&self, service: &str, replicas_wanted: u32, options: ScaleOptions) -> ControlResult<()> {
        let call = Call::Scale {
            service: service.to_string(),
            replicas: replicas_wanted,
            options,
        };
        let mut inner = self.record(call, Some(Op::Scale))?;
        inner
            .services
            .insert(service.to_string(), replicas(service, replicas_wanted));
        Ok(())
    }

    async fn exec(
        &self,
        service: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> ControlResult<Vec<u8>> {
        let call = Call::Exec {
            service: service.to_string(),
            command: command.to_vec(),
        };
        let mut inner = self.record(call, None)?;
        let line = command.join(" ");
        if inner.failing_exec.iter().any(|p| line.contains(p.as_str())) {
            return Err(injected(&line));
        }

        match command.first().map(String::as_str) {
            Some("pg_dump") => inner.database.clone().ok_or_else(|| injected(&line)),
            Some("dropdb") => {
                inner.database = None;
                Ok(Vec::new())
            }
            Some("createdb") => {
                inner.database = Some(Vec::new());
                Ok(Vec::new())
            }
            Some("psql") => {
                if inner.database.is_none() {
                    return Err(injected(&line));
                }
                inner.database = stdin;
                Ok(Vec::new())
            }
            _ if line.contains("dumpdata") => Ok(inner.app_state.clone()),
            _ if line.contains("loaddata") => {
                inner.imported_app_state = stdin;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn status(&self) -> ControlResult<Vec<ServiceState>> {
        let inner = self.record(Call::Status, Some(Op::Status))?;
        Ok(inner.services.values().cloned().collect())
    }

    async fn build(&self, services: &[String]) -> ControlResult<()> {
        self.record(Call::Build(services.to_vec()), Some(Op::Build))
            .map(drop)
    }
}

/// Health probe that replays a fixed script, then repeats a fallback.
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Vec<ProbeResult>,
    fallback: ProbeResult,
    checks: AtomicU32,
}

impl ScriptedProbe {
    /// Replay `script`, then keep failing.
    pub fn new(script: Vec<ProbeResult>) -> Self {
        Self {
            script,
            fallback: ProbeResult::Failed,
            checks: AtomicU32::new(0),
        }
    }

    pub fn always(result: ProbeResult) -> Self {
        Self {
            script: Vec::new(),
            fallback: result,
            checks: AtomicU32::new(0),
        }
    }

    /// Fail `n - 1` times, then stay healthy.
    pub fn healthy_on_attempt(n: u32) -> Self {
        let mut script = vec![ProbeResult::Unhealthy; n.saturating_sub(1) as usize];
        script.push(ProbeResult::Healthy);
        Self {
            script,
            fallback: ProbeResult::Healthy,
            checks: AtomicU32::new(0),
        }
    }

    /// Probes performed so far.
    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

impl HealthProbe for ScriptedProbe {
    async fn check(&self, _endpoint: &str, _timeout: Duration) -> ProbeResult {
        let n = self.checks.fetch_add(1, Ordering::SeqCst) as usize;
        self.script.get(n).copied().unwrap_or(self.fallback)
    }
}
