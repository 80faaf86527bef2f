//! Per-job execution on top of the container runtime.
//!
//! - [`lifecycle`]: classifies runtime events into per-job container phases
//!   and reconciles containers left behind by an earlier run
//! - [`session`]: startup sequence and build stream of one started container
//! - [`health`]: readiness polling of a freshly started builder

pub mod health;
pub mod lifecycle;
pub mod session;

pub use lifecycle::{classify, LifecycleAction, LifecycleEvent};
pub use session::{SessionOutcome, SessionReport, SessionRequest};
