//! The routing switch contract.

use thiserror::Error;
use tracing::info;

use bluegreen_core::{BoxFuture, TargetGroupRef};

use crate::load_balancer::LoadBalancer;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// The load balancer API could not be reached or rejected the call
    /// transiently.
    #[error("load balancer unavailable: {0}")]
    Unavailable(String),

    #[error("unknown target group: {0}")]
    UnknownTargetGroup(String),

    #[error("listener not found: {0}")]
    ListenerNotFound(String),
}

impl RoutingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RoutingError::Unavailable(_))
    }
}

/// Reads and repoints the live routing destination of one environment.
///
/// `get_active_target_group` reports what the load balancer is actually
/// doing, independent of any recorded state. `set_active_target_group` is
/// a single configuration update: traffic moves as a step, not a ramp.
pub trait RoutingSwitch: Send + Sync {
    fn get_active_target_group(&self) -> BoxFuture<'_, Result<TargetGroupRef, RoutingError>>;

    fn set_active_target_group<'a>(
        &'a self,
        target_group: &'a TargetGroupRef,
    ) -> BoxFuture<'a, Result<(), RoutingError>>;
}

/// Routing switch bound to one listener of a load balancer.
#[derive(Clone)]
pub struct ListenerSwitch {
    lb: LoadBalancer,
    listener: String,
}

impl ListenerSwitch {
    pub fn new(lb: LoadBalancer, listener: impl Into<String>) -> Self {
        Self {
            lb,
            listener: listener.into(),
        }
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }
}

impl RoutingSwitch for ListenerSwitch {
    fn get_active_target_group(&self) -> BoxFuture<'_, Result<TargetGroupRef, RoutingError>> {
        Box::pin(async move { self.lb.listener_target(&self.listener) })
    }

    fn set_active_target_group<'a>(
        &'a self,
        target_group: &'a TargetGroupRef,
    ) -> BoxFuture<'a, Result<(), RoutingError>> {
        Box::pin(async move {
            self.lb.point_listener(&self.listener, target_group)?;
            info!(listener = %self.listener, %target_group, "listener repointed");
            Ok(())
        })
    }
}
