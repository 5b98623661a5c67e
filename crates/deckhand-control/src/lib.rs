//! deckhand-control — the two external leaves deckhand drives.
//!
//! # Components
//!
//! - **`plane`** — the `ServiceControlPlane` capability: start, stop and
//!   scale named services, run commands inside them, report their state.
//! - **`compose`** — `ServiceControlPlane` over the `docker compose` CLI.
//! - **`health`** — the `HealthProbe` capability, an HTTP probe, and the
//!   bounded fixed-interval polling loop used by rollout and restore.
//! - **`testing`** (feature `testing`) — in-memory doubles that record every
//!   call, for driving the managers in tests.

pub mod compose;
pub mod error;
pub mod health;
pub mod plane;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use compose::ComposeControlPlane;
pub use error::{ControlError, ControlResult};
pub use health::{HealthProbe, HealthVerdict, HttpProbe, ProbeResult, poll_until_healthy};
pub use plane::{ScaleOptions, ServiceControlPlane, ServiceState, find_service};
