//! Requests and results exchanged with callers of the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bluegreen_core::{Color, TargetGroupRef};
use bluegreen_routing::RoutingError;
use bluegreen_state::StateError;

use crate::phase::DeploymentPhase;

/// Body of a deployment trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Color to make live. `None` means whichever color is inactive.
    #[serde(default)]
    pub target: Option<Color>,
}

impl DeployRequest {
    pub fn to(color: Color) -> Self {
        Self {
            target: Some(color),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    /// Committed, or already converged.
    Success,
    /// Stopped before traffic moved.
    Aborted,
    /// Traffic moved, then was routed back to the old color.
    RolledBack,
    /// Could not reach a clean terminal state; see `detail`.
    Failed,
}

/// What went wrong, for every non-success outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LockConflict,
    /// Live routing disagreed with the committed record.
    Drift,
    Fleet,
    Health,
    Routing,
    Regression,
    Cancelled,
    State,
    UnknownEnvironment,
}

/// Terminal result of one `trigger_deployment` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub environment: String,
    pub outcome: DeploymentOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    /// Phase the run ended in; for failures, the phase that failed.
    pub phase: DeploymentPhase,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_color: Option<Color>,
    /// Phases entered, in order.
    #[serde(default)]
    pub phases: Vec<DeploymentPhase>,
    pub duration_ms: u64,
}

impl DeploymentResult {
    pub fn is_success(&self) -> bool {
        self.outcome == DeploymentOutcome::Success
    }

    pub fn is_lock_conflict(&self) -> bool {
        self.kind == Some(FailureKind::LockConflict)
    }

    pub fn visited(&self, phase: DeploymentPhase) -> bool {
        self.phases.contains(&phase)
    }

    /// Result for an environment the orchestrator does not manage.
    pub fn unknown_environment(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            outcome: DeploymentOutcome::Aborted,
            kind: Some(FailureKind::UnknownEnvironment),
            phase: DeploymentPhase::Idle,
            detail: format!("unknown environment `{environment}`"),
            from_color: None,
            to_color: None,
            phases: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Result of a successful `reconcile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub environment: String,
    pub active_color: Color,
    pub target_group: TargetGroupRef,
    /// Whether routing had drifted and was repointed.
    pub repointed: bool,
}

/// How `settle` resolved an environment's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleAction {
    /// No lock was held.
    NothingHeld,
    /// Routing was still on the recorded color; the lock was dropped.
    Released,
    /// Routing had moved; the record now names the live color.
    Committed,
}

/// Result of a successful `settle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleReport {
    pub environment: String,
    pub action: SettleAction,
    pub active_color: Color,
    pub target_group: TargetGroupRef,
    /// Token of the abandoned lock, if one was held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unknown environment `{0}`")]
    UnknownEnvironment(String),

    #[error("deployment in progress for `{0}`")]
    InProgress(String),

    #[error("live routing points at {0}, which belongs to neither color")]
    ForeignTarget(TargetGroupRef),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}
