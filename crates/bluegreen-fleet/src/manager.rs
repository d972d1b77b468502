//! Fleet manager contract and the retrying adapter.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use bluegreen_core::{BackoffConfig, BoxFuture, Color, retry};

/// Errors from the compute-management layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    /// Throttling, timeouts, 5xx responses. Safe to retry.
    #[error("transient fleet API failure: {0}")]
    Transient(String),

    /// The request was rejected outright (quota exceeded, invalid config).
    #[error("fleet request rejected: {0}")]
    Fatal(String),
}

impl FleetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Transient(_))
    }
}

/// Point-in-time snapshot of one color fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FleetStatus {
    pub desired: u32,
    /// Instances running and registered.
    pub in_service: u32,
    /// Instances still launching.
    pub pending: u32,
    /// Instances the fleet itself reports as unhealthy.
    pub unhealthy: u32,
    /// Launch attempts that failed terminally since the last capacity change.
    pub failed_launches: u32,
}

impl FleetStatus {
    /// Every requested instance failed to launch and nothing is left trying.
    pub fn all_launches_failed(&self) -> bool {
        self.desired > 0
            && self.in_service == 0
            && self.pending == 0
            && self.failed_launches >= self.desired
    }
}

/// Addresses the blue and green fleets of a single environment.
///
/// `scale` only requests convergence; it does not wait for instances.
pub trait FleetManager: Send + Sync {
    fn scale(&self, color: Color, desired_capacity: u32) -> BoxFuture<'_, Result<(), FleetError>>;

    fn describe(&self, color: Color) -> BoxFuture<'_, Result<FleetStatus, FleetError>>;
}

/// Wraps a fleet manager and retries transient failures with backoff.
pub struct RetryingFleet {
    inner: Arc<dyn FleetManager>,
    backoff: BackoffConfig,
}

impl RetryingFleet {
    pub fn new(inner: Arc<dyn FleetManager>, backoff: BackoffConfig) -> Self {
        Self { inner, backoff }
    }
}

impl FleetManager for RetryingFleet {
    fn scale(&self, color: Color, desired_capacity: u32) -> BoxFuture<'_, Result<(), FleetError>> {
        Box::pin(async move {
            debug!(%color, desired_capacity, "requesting fleet capacity");
            retry(&self.backoff, "fleet.scale", FleetError::is_retryable, move || {
                self.inner.scale(color, desired_capacity)
            })
            .await
        })
    }

    fn describe(&self, color: Color) -> BoxFuture<'_, Result<FleetStatus, FleetError>> {
        Box::pin(async move {
            retry(&self.backoff, "fleet.describe", FleetError::is_retryable, move || {
                self.inner.describe(color)
            })
            .await
        })
    }
}
