//! Rollout phases and the phase log.

use std::fmt;
use std::time::Duration;

use deckhand_core::FailureClass;

/// Phase of a rolling update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Every configured service must be running.
    Preflight,
    Backup,
    /// Build new images. Running containers are untouched.
    Build,
    /// Schema migrations and static assets. First mutating phase.
    Migrate,
    /// One extra web replica on the new image next to the old ones.
    ScaleOut,
    HealthGate,
    /// Back to the steady replica count, keeping the new replica.
    Promote,
    /// Restart background workers on the new image.
    WorkerRefresh,
    CacheInvalidate,
    FinalVerify,
    Done,
    /// Scale the web tier back to its pre-update count.
    Rollback,
    Abort,
}

impl RolloutPhase {
    /// Whether the state machine may go from `self` to `next`.
    ///
    /// Rollback is entered from the health gate and also from a scale-out
    /// whose scale call failed. Both happen before promotion, while the old
    /// replicas still serve traffic.
    pub fn can_transition_to(self, next: RolloutPhase) -> bool {
        use RolloutPhase::*;
        matches!(
            (self, next),
            (Preflight, Backup | Abort)
                | (Backup, Build | Abort)
                | (Build, Migrate | Abort)
                | (Migrate, ScaleOut | Abort)
                | (ScaleOut, HealthGate | Rollback)
                | (HealthGate, Promote | Rollback)
                | (Promote, WorkerRefresh | Abort)
                | (WorkerRefresh, CacheInvalidate | Abort)
                | (CacheInvalidate, FinalVerify | Abort)
                | (FinalVerify, Done)
        )
    }

    /// No transition leaves a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, RolloutPhase::Done | RolloutPhase::Rollback | RolloutPhase::Abort)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RolloutPhase::Preflight => "preflight",
            RolloutPhase::Backup => "backup",
            RolloutPhase::Build => "build",
            RolloutPhase::Migrate => "migrate",
            RolloutPhase::ScaleOut => "scale-out",
            RolloutPhase::HealthGate => "health-gate",
            RolloutPhase::Promote => "promote",
            RolloutPhase::WorkerRefresh => "worker-refresh",
            RolloutPhase::CacheInvalidate => "cache-invalidate",
            RolloutPhase::FinalVerify => "final-verify",
            RolloutPhase::Done => "done",
            RolloutPhase::Rollback => "rollback",
            RolloutPhase::Abort => "abort",
        }
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How a phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseResult {
    Ok,
    Skipped(String),
    /// Completed, but something the operator should know about went wrong.
    Warned(String),
    Failed { class: FailureClass, reason: String },
}

impl fmt::Display for PhaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseResult::Ok => f.write_str("ok"),
            PhaseResult::Skipped(reason) => write!(f, "skipped ({reason})"),
            PhaseResult::Warned(reason) => write!(f, "warning: {reason}"),
            PhaseResult::Failed { class, reason } => write!(f, "failed [{class}]: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord<P = RolloutPhase> {
    pub phase: P,
    pub result: PhaseResult,
    pub elapsed: Duration,
}

/// Ordered record of every phase that ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseLog<P = RolloutPhase> {
    records: Vec<PhaseRecord<P>>,
}

impl<P> Default for PhaseLog<P> {
    fn default() -> Self {
        Self { records: Vec::new() }
    }
}

impl<P: Copy + PartialEq> PhaseLog<P> {
    pub fn push(&mut self, phase: P, result: PhaseResult, elapsed: Duration) {
        self.records.push(PhaseRecord {
            phase,
            result,
            elapsed,
        });
    }

    pub fn records(&self) -> &[PhaseRecord<P>] {
        &self.records
    }

    /// Phases in the order they ran.
    pub fn phases(&self) -> Vec<P> {
        self.records.iter().map(|r| r.phase).collect()
    }

    pub fn result_of(&self, phase: P) -> Option<&PhaseResult> {
        self.records.iter().rev().find(|r| r.phase == phase).map(|r| &r.result)
    }

    pub fn ran(&self, phase: P) -> bool {
        self.records.iter().any(|r| r.phase == phase)
    }
}

impl<P: fmt::Display> fmt::Display for PhaseLog<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(
                f,
                "  {:<18} {:>7.1}s  {}",
                record.phase,
                record.elapsed.as_secs_f64(),
                record.result
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RolloutPhase::*;

    const ALL: [RolloutPhase; 13] = [
        Preflight,
        Backup,
        Build,
        Migrate,
        ScaleOut,
        HealthGate,
        Promote,
        WorkerRefresh,
        CacheInvalidate,
        FinalVerify,
        Done,
        Rollback,
        Abort,
    ];

    #[test]
    fn happy_path_is_a_chain() {
        let path = [
            Preflight,
            Backup,
            Build,
            Migrate,
            ScaleOut,
            HealthGate,
            Promote,
            WorkerRefresh,
            CacheInvalidate,
            FinalVerify,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn rollback_only_inside_reversible_window() {
        let from: Vec<_> = ALL.into_iter().filter(|p| p.can_transition_to(Rollback)).collect();
        assert_eq!(from, vec![ScaleOut, HealthGate]);
    }

    #[test]
    fn abort_sources() {
        let from: Vec<_> = ALL.into_iter().filter(|p| p.can_transition_to(Abort)).collect();
        assert_eq!(
            from,
            vec![Preflight, Backup, Build, Migrate, Promote, WorkerRefresh, CacheInvalidate]
        );
        assert!(!HealthGate.can_transition_to(Abort));
        assert!(!FinalVerify.can_transition_to(Abort));
    }

    #[test]
    fn no_skipping_ahead_or_going_back() {
        assert!(!Migrate.can_transition_to(HealthGate));
        assert!(!Preflight.can_transition_to(ScaleOut));
        assert!(!Promote.can_transition_to(ScaleOut));
        assert!(!HealthGate.can_transition_to(Done));
    }

    #[test]
    fn terminal_phases_have_no_exits() {
        for phase in ALL.into_iter().filter(|p| p.is_terminal()) {
            assert!(ALL.iter().all(|next| !phase.can_transition_to(*next)), "{phase}");
        }
        assert!(!FinalVerify.is_terminal());
    }

    #[test]
    fn log_renders_each_record() {
        let mut log = PhaseLog::default();
        log.push(Preflight, PhaseResult::Ok, Duration::from_millis(120));
        log.push(Backup, PhaseResult::Skipped("--no-backup".into()), Duration::ZERO);
        let text = log.to_string();
        assert!(text.contains("preflight"));
        assert!(text.contains("skipped (--no-backup)"));
        assert_eq!(log.phases(), vec![Preflight, Backup]);
        assert!(log.ran(Backup));
        assert!(!log.ran(Migrate));
    }
}
