//! Persisted deployment record and its read-only status view.

use serde::{Deserialize, Serialize};

use bluegreen_core::{Color, TargetGroupRef};

/// Single source of truth for which color of an environment is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub environment: String,
    pub active_color: Color,
    pub active_target_group: TargetGroupRef,
    /// Unix timestamp (seconds) of the last committed switch; 0 if never.
    pub last_transition_time: u64,
    pub transition_in_progress: bool,
    /// Identifies the attempt holding the lock while a transition is in progress.
    #[serde(default)]
    pub lock_token: Option<String>,
    /// Bumped by the store on every successful compare-and-swap.
    #[serde(default)]
    pub revision: u64,
}

impl DeploymentRecord {
    /// Initial record for a freshly provisioned environment.
    pub fn new(
        environment: &str,
        active_color: Color,
        active_target_group: TargetGroupRef,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            active_color,
            active_target_group,
            last_transition_time: 0,
            transition_in_progress: false,
            lock_token: None,
            revision: 0,
        }
    }

    /// The same record with the transition lock held by `token`.
    pub fn locked(&self, token: &str) -> Self {
        Self {
            transition_in_progress: true,
            lock_token: Some(token.to_string()),
            ..self.clone()
        }
    }

    /// The same record with the lock released and the active color unchanged.
    pub fn released(&self) -> Self {
        Self {
            transition_in_progress: false,
            lock_token: None,
            ..self.clone()
        }
    }

    /// The record after a completed switch to `color`.
    pub fn committed(&self, color: Color, target_group: TargetGroupRef, now: u64) -> Self {
        Self {
            active_color: color,
            active_target_group: target_group,
            last_transition_time: now,
            transition_in_progress: false,
            lock_token: None,
            ..self.clone()
        }
    }

    /// Whether `token` currently owns the transition lock.
    pub fn is_locked_by(&self, token: &str) -> bool {
        self.transition_in_progress && self.lock_token.as_deref() == Some(token)
    }

    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus::from(self)
    }
}

/// What status tooling sees for an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub environment: String,
    pub active_color: Color,
    pub active_target_group: TargetGroupRef,
    pub transition_in_progress: bool,
    pub last_transition_time: u64,
}

impl From<&DeploymentRecord> for DeploymentStatus {
    fn from(r: &DeploymentRecord) -> Self {
        Self {
            environment: r.environment.clone(),
            active_color: r.active_color,
            active_target_group: r.active_target_group.clone(),
            transition_in_progress: r.transition_in_progress,
            last_transition_time: r.last_transition_time,
        }
    }
}
