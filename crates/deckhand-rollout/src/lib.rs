//! deckhand-rollout — zero-downtime updates of the web tier.
//!
//! An update is a linear state machine with a reversible window: from the
//! moment an extra web replica is started until it passes the health gate,
//! any failure scales the tier back to its previous size. Failures before
//! that window abort with the stack unchanged; failures after it abort and
//! flag the stack for manual intervention.
//!
//! # Components
//!
//! - **`phase`** — phases, allowed transitions, the phase log
//! - **`controller`** — `RolloutController` (step, run, rollback)
//! - **`deploy`** — `Deployer` for a first-time bring-up

pub mod controller;
pub mod deploy;
pub mod phase;

pub use controller::{DeploymentAttempt, Outcome, RolloutController, UpdateOptions};
pub use deploy::{DeployReport, DeployStep, Deployer};
pub use phase::{PhaseLog, PhaseRecord, PhaseResult, RolloutPhase};
