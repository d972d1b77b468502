//! bluegreen-sim — an in-process cloud for standalone mode and tests.
//!
//! `SimulatedCloud` plays both external collaborators of one environment:
//! the compute-management layer behind `FleetManager` and the signal source
//! behind `MetricsSource`. Instances take `boot_time` to come into service;
//! knobs per color inject launch failures, failing health checks, bad
//! traffic, quota rejections, and throttling.
//!
//! `provision` wires an environment into a shared `LoadBalancer` the way an
//! infrastructure template would: both target groups registered, one
//! listener pointing at the initial color, and that color already running
//! at working capacity.

pub mod cloud;

use std::sync::Arc;

use tracing::info;

use bluegreen_core::EnvironmentConfig;
use bluegreen_routing::{ListenerSwitch, LoadBalancer, RoutingError};

pub use cloud::{ColorKnobs, SimulatedCloud};

/// Listener name used for an environment's live traffic.
pub fn listener_name(environment: &str) -> String {
    format!("{environment}-https")
}

/// Stand up an environment on the simulated cloud.
pub fn provision(
    env: &EnvironmentConfig,
    lb: &LoadBalancer,
) -> Result<(Arc<SimulatedCloud>, ListenerSwitch), RoutingError> {
    for tg in [&env.target_groups.blue, &env.target_groups.green] {
        lb.register_target_group(tg);
    }
    let listener = listener_name(&env.name);
    let live = env.initial_color;
    lb.create_listener(&listener, env.target_group(live))?;

    let cloud = Arc::new(SimulatedCloud::new(env.clone()));
    cloud.seed_running(live, env.working_capacity);
    info!(
        environment = %env.name,
        color = %live,
        capacity = env.working_capacity,
        %listener,
        "environment provisioned"
    );
    Ok((cloud, ListenerSwitch::new(lb.clone(), listener)))
}
