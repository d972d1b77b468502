//! In-memory bookkeeping for one deployment run.

use tokio::time::Instant;
use tracing::info;

use bluegreen_core::Color;
use bluegreen_health::HealthOutcome;

use crate::phase::DeploymentPhase;
use crate::result::{DeploymentOutcome, DeploymentResult, FailureKind};

/// Ephemeral state of a deployment attempt. Dropped when the run ends.
#[derive(Debug)]
pub struct DeploymentAttempt {
    pub environment: String,
    /// Lock token written into the record while the attempt holds it.
    pub token: String,
    pub from_color: Option<Color>,
    pub to_color: Option<Color>,
    pub phase: DeploymentPhase,
    pub started_at: Instant,
    pub health: Option<HealthOutcome>,
    /// Set once the switch to the new color has been confirmed.
    pub traffic_moved: bool,
    phases: Vec<DeploymentPhase>,
}

impl DeploymentAttempt {
    pub fn new(environment: &str, token: String) -> Self {
        Self {
            environment: environment.to_string(),
            token,
            from_color: None,
            to_color: None,
            phase: DeploymentPhase::Idle,
            started_at: Instant::now(),
            health: None,
            traffic_moved: false,
            phases: Vec::new(),
        }
    }

    pub fn enter(&mut self, phase: DeploymentPhase) {
        info!(
            environment = %self.environment,
            token = %self.token,
            from = %self.phase,
            to = %phase,
            "deployment phase"
        );
        self.phase = phase;
        self.phases.push(phase);
    }

    pub fn phases(&self) -> &[DeploymentPhase] {
        &self.phases
    }

    /// Build the terminal result. `phase` is reported as where the run ended.
    pub fn finish(
        &self,
        outcome: DeploymentOutcome,
        kind: Option<FailureKind>,
        phase: DeploymentPhase,
        detail: String,
    ) -> DeploymentResult {
        DeploymentResult {
            environment: self.environment.clone(),
            outcome,
            kind,
            phase,
            detail,
            from_color: self.from_color,
            to_color: self.to_color,
            phases: self.phases.clone(),
            duration_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}
