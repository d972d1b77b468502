//! Metrics and health signal source.
//!
//! The signal source is an external collaborator: it reports per-target-group
//! health-check counts, request-level traffic metrics, and the per-fleet
//! metric a scaling policy consumes. Implementations wrap a cloud provider's
//! monitoring API; `bluegreen-sim` provides an in-process one.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::config::ScalingPolicy;
use crate::error::SignalError;
use crate::types::TargetGroupRef;

/// Boxed, sendable future returned by the cloud-facing traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health-check counts for the targets registered in a target group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetHealth {
    /// Targets passing health checks.
    pub healthy: u32,
    /// Targets failing health checks.
    pub unhealthy: u32,
    /// Targets registered but still inside their initial check period.
    pub initial: u32,
}

impl TargetHealth {
    pub fn total(&self) -> u32 {
        self.healthy + self.unhealthy + self.initial
    }

    /// Fraction of registered targets that pass. An empty group is 0.0.
    pub fn healthy_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.healthy as f64 / total as f64,
        }
    }
}

/// Request-level metrics observed on a target group over the last interval.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficSample {
    pub request_count: u64,
    /// Percentage of requests that failed (0-100).
    pub error_rate: f64,
    pub p99_latency_ms: u64,
}

/// Source of health and metric signals.
pub trait MetricsSource: Send + Sync {
    /// Health-check counts for a target group.
    fn target_health<'a>(
        &'a self,
        target_group: &'a TargetGroupRef,
    ) -> BoxFuture<'a, Result<TargetHealth, SignalError>>;

    /// Traffic metrics for a target group.
    fn traffic<'a>(
        &'a self,
        target_group: &'a TargetGroupRef,
    ) -> BoxFuture<'a, Result<TrafficSample, SignalError>>;

    /// The raw metric a scaling policy tracks for a fleet: average CPU
    /// percent for `CpuTarget`, total queue depth for `BacklogPerInstance`.
    /// `None` when no datapoint is available yet.
    fn fleet_metric<'a>(
        &'a self,
        fleet: &'a str,
        policy: &'a ScalingPolicy,
    ) -> BoxFuture<'a, Result<Option<f64>, SignalError>>;
}
