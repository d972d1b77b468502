//! bluegreen-orchestrator — drives one blue/green deployment per call.
//!
//! # State machine
//!
//! ```text
//! IDLE → LOCKING → SCALING_INACTIVE → VERIFYING_HEALTH → SWITCHING_TRAFFIC
//!      → MONITORING → DRAINING_OLD → COMMITTING → IDLE
//!
//! SCALING_INACTIVE | VERIFYING_HEALTH | SWITCHING_TRAFFIC ──fail/cancel──▶ ABORTING
//! MONITORING | DRAINING_OLD ──regression/cancel──▶ ROLLING_BACK
//! ```
//!
//! The deployment record is the lock: LOCKING and COMMITTING are both
//! compare-and-swap writes, and the record only names the new color after
//! traffic has moved and the old color has drained. Every run ends in a
//! `DeploymentResult`; nothing escapes as an error.
//!
//! A lock whose run is gone (process killed, task dropped, commit write
//! failed) is cleared by `Orchestrator::settle`, which makes the record
//! agree with live routing. `Orchestrator::recover` does this at startup
//! for every locked record.
//!
//! The `DeploymentSupervisor` runs deployments on their own tasks and owns
//! their cancellation channels.

pub mod attempt;
pub mod cancel;
pub mod controller;
pub mod handle;
pub mod phase;
pub mod result;
pub mod supervisor;

pub use attempt::DeploymentAttempt;
pub use cancel::CancelSignal;
pub use controller::Orchestrator;
pub use handle::EnvironmentHandle;
pub use phase::DeploymentPhase;
pub use result::{
    DeployRequest, DeploymentOutcome, DeploymentResult, FailureKind, ReconcileError,
    ReconcileReport, SettleAction, SettleReport,
};
pub use supervisor::DeploymentSupervisor;
