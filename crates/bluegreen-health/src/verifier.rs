//! Health verifier: waits for a freshly scaled color to become healthy.
//!
//! Polls the fleet snapshot and the target group's health-check counts at a
//! fixed interval. An instance counts once it is both in service and
//! passing: `min(in_service, healthy targets)`.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use bluegreen_core::{Color, MetricsSource, TargetGroupRef};
use bluegreen_fleet::{FleetError, FleetManager};

/// Result of waiting on a color to become healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Threshold met.
    Healthy { passing: u32 },
    /// The timeout elapsed first.
    Timeout { passing: u32, required: u32 },
    /// A terminal failure signal was observed.
    Unhealthy { reason: String },
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy { .. })
    }
}

/// Read-only view over one environment's fleet and target-group signals.
pub struct HealthVerifier<'a> {
    fleet: &'a dyn FleetManager,
    metrics: &'a dyn MetricsSource,
    poll_interval: Duration,
}

impl<'a> HealthVerifier<'a> {
    pub fn new(
        fleet: &'a dyn FleetManager,
        metrics: &'a dyn MetricsSource,
        poll_interval: Duration,
    ) -> Self {
        Self {
            fleet,
            metrics,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Clamp the poll interval to half the grace period.
    pub fn within_grace(mut self, grace_period: Duration) -> Self {
        let ceiling = (grace_period / 2).max(Duration::from_millis(1));
        self.poll_interval = self.poll_interval.min(ceiling);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Poll until `min_healthy` instances of `color` are in service and
    /// passing on `target_group`, or `timeout` elapses.
    pub async fn await_healthy(
        &self,
        color: Color,
        target_group: &TargetGroupRef,
        min_healthy: u32,
        timeout: Duration,
    ) -> HealthOutcome {
        let deadline = Instant::now() + timeout;
        let mut passing = 0;

        loop {
            match self.sample(color, target_group).await {
                Ok(Some(now_passing)) => passing = now_passing,
                Ok(None) => {}
                Err(reason) => {
                    warn!(%color, %target_group, %reason, "terminal health signal");
                    return HealthOutcome::Unhealthy { reason };
                }
            }

            if passing >= min_healthy {
                info!(%color, %target_group, passing, required = min_healthy, "color healthy");
                return HealthOutcome::Healthy { passing };
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(%color, passing, required = min_healthy, "health verification timed out");
                return HealthOutcome::Timeout {
                    passing,
                    required: min_healthy,
                };
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// One poll. `Ok(None)` means the signals could not be read this round.
    async fn sample(
        &self,
        color: Color,
        target_group: &TargetGroupRef,
    ) -> Result<Option<u32>, String> {
        let status = match self.fleet.describe(color).await {
            Ok(status) => status,
            Err(FleetError::Fatal(e)) => return Err(format!("fleet describe rejected: {e}")),
            Err(e) => {
                debug!(%color, error = %e, "describe failed, polling again");
                return Ok(None);
            }
        };
        if status.all_launches_failed() {
            return Err(format!(
                "all {} requested instances failed to launch",
                status.desired
            ));
        }

        let health = match self.metrics.target_health(target_group).await {
            Ok(health) => health,
            Err(e) => {
                debug!(%target_group, error = %e, "target health unavailable, polling again");
                return Ok(None);
            }
        };

        let passing = status.in_service.min(health.healthy);
        debug!(
            %color,
            in_service = status.in_service,
            pending = status.pending,
            healthy_targets = health.healthy,
            passing,
            "health poll"
        );
        Ok(Some(passing))
    }
}
