//! The collaborators one environment is deployed through.

use std::sync::Arc;

use bluegreen_core::{EnvironmentConfig, MetricsSource};
use bluegreen_fleet::FleetManager;
use bluegreen_routing::RoutingSwitch;

/// Configuration plus the fleet, routing and signal adapters of one
/// environment.
#[derive(Clone)]
pub struct EnvironmentHandle {
    pub config: EnvironmentConfig,
    pub fleet: Arc<dyn FleetManager>,
    pub routing: Arc<dyn RoutingSwitch>,
    pub metrics: Arc<dyn MetricsSource>,
}

impl EnvironmentHandle {
    pub fn new(
        config: EnvironmentConfig,
        fleet: Arc<dyn FleetManager>,
        routing: Arc<dyn RoutingSwitch>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            config,
            fleet,
            routing,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}
