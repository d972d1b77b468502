//! Deployment phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a deployment attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Idle,
    /// Acquiring the per-environment lock on the deployment record.
    Locking,
    /// Scaling the inactive color up to working capacity.
    ScalingInactive,
    /// Waiting for the inactive color to pass health checks.
    VerifyingHealth,
    /// Repointing the listener at the new color's target group.
    SwitchingTraffic,
    /// Watching the newly live color for regressions.
    Monitoring,
    /// Deregistration delay, then scaling the old color to zero.
    DrainingOld,
    /// Writing the new active color to the deployment record.
    Committing,
    /// Pre-switch failure: scaling the new color back down, releasing the lock.
    Aborting,
    /// Post-switch failure: routing traffic back to the old color.
    RollingBack,
}

impl DeploymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentPhase::Idle => "idle",
            DeploymentPhase::Locking => "locking",
            DeploymentPhase::ScalingInactive => "scaling_inactive",
            DeploymentPhase::VerifyingHealth => "verifying_health",
            DeploymentPhase::SwitchingTraffic => "switching_traffic",
            DeploymentPhase::Monitoring => "monitoring",
            DeploymentPhase::DrainingOld => "draining_old",
            DeploymentPhase::Committing => "committing",
            DeploymentPhase::Aborting => "aborting",
            DeploymentPhase::RollingBack => "rolling_back",
        }
    }

    /// Whether live traffic may already be on the new color.
    pub fn is_post_switch(&self) -> bool {
        matches!(
            self,
            DeploymentPhase::Monitoring | DeploymentPhase::DrainingOld | DeploymentPhase::Committing
        )
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
