//! Simulated fleets and signals for a single environment.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use bluegreen_core::{
    BoxFuture, Color, ColorPair, EnvironmentConfig, MetricsSource, ScalingPolicy, SignalError,
    TargetGroupRef, TargetHealth, TrafficSample,
};
use bluegreen_fleet::{FleetError, FleetManager, FleetStatus};

/// Behaviour injected into one color's fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorKnobs {
    /// New launches fail once their boot time elapses.
    pub fail_launches: bool,
    /// Booted instances fail their target-group health checks.
    pub failing_health_checks: bool,
    /// Error rate (percent) reported on the color's target group.
    pub error_rate: f64,
    pub p99_latency_ms: u64,
    /// Average CPU reported for the fleet.
    pub cpu_percent: f64,
    /// Requests per in-service instance per sample.
    pub requests_per_instance: u64,
}

impl Default for ColorKnobs {
    fn default() -> Self {
        Self {
            fail_launches: false,
            failing_health_checks: false,
            error_rate: 0.1,
            p99_latency_ms: 120,
            cpu_percent: 40.0,
            requests_per_instance: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Instance {
    ready_at: Instant,
    /// Launch fails at `ready_at` instead of coming into service.
    doomed: bool,
}

impl Instance {
    fn in_service(&self, now: Instant) -> bool {
        !self.doomed && now >= self.ready_at
    }

    fn pending(&self, now: Instant) -> bool {
        now < self.ready_at
    }

    fn failed(&self, now: Instant) -> bool {
        self.doomed && now >= self.ready_at
    }
}

#[derive(Debug, Default)]
struct ColorFleet {
    desired: u32,
    instances: Vec<Instance>,
    knobs: ColorKnobs,
}

#[derive(Debug)]
struct SimState {
    fleets: ColorPair<ColorFleet>,
    boot_time: Duration,
    /// Largest capacity the account may request; above it scaling is rejected.
    quota: Option<u32>,
    /// Scale calls still to be throttled.
    throttled_scales: u32,
    /// Metrics calls still to fail.
    signal_outages: u32,
    queue_depth: f64,
    scale_log: Vec<(Color, u32)>,
}

impl SimState {
    fn fleet(&self, color: Color) -> &ColorFleet {
        self.fleets.get(color)
    }

    fn fleet_mut(&mut self, color: Color) -> &mut ColorFleet {
        match color {
            Color::Blue => &mut self.fleets.blue,
            Color::Green => &mut self.fleets.green,
        }
    }

    fn take_signal_outage(&mut self) -> Result<(), SignalError> {
        if self.signal_outages > 0 {
            self.signal_outages -= 1;
            return Err(SignalError::Unavailable("metrics API throttled".into()));
        }
        Ok(())
    }
}

/// One environment's blue and green fleets plus the signals they emit.
pub struct SimulatedCloud {
    env: EnvironmentConfig,
    state: Mutex<SimState>,
}

impl SimulatedCloud {
    pub fn new(env: EnvironmentConfig) -> Self {
        Self {
            env,
            state: Mutex::new(SimState {
                fleets: ColorPair {
                    blue: ColorFleet::default(),
                    green: ColorFleet::default(),
                },
                boot_time: Duration::from_secs(30),
                quota: None,
                throttled_scales: 0,
                signal_outages: 0,
                queue_depth: 0.0,
                scale_log: Vec::new(),
            }),
        }
    }

    pub fn environment(&self) -> &EnvironmentConfig {
        &self.env
    }

    /// Put `count` already-booted instances in `color`.
    pub fn seed_running(&self, color: Color, count: u32) {
        let mut state = self.state.lock().expect("sim lock");
        let now = Instant::now();
        let fleet = state.fleet_mut(color);
        fleet.desired = count;
        fleet.instances = (0..count)
            .map(|_| Instance {
                ready_at: now,
                doomed: false,
            })
            .collect();
    }

    pub fn set_boot_time(&self, boot_time: Duration) {
        self.state.lock().expect("sim lock").boot_time = boot_time;
    }

    pub fn set_quota(&self, quota: Option<u32>) {
        self.state.lock().expect("sim lock").quota = quota;
    }

    /// Throttle the next `n` scale calls with a transient error.
    pub fn throttle_next_scales(&self, n: u32) {
        self.state.lock().expect("sim lock").throttled_scales = n;
    }

    /// Fail the next `n` metrics calls.
    pub fn fail_next_signals(&self, n: u32) {
        self.state.lock().expect("sim lock").signal_outages = n;
    }

    pub fn set_queue_depth(&self, depth: f64) {
        self.state.lock().expect("sim lock").queue_depth = depth;
    }

    /// Adjust one color's knobs in place.
    pub fn configure(&self, color: Color, f: impl FnOnce(&mut ColorKnobs)) {
        let mut state = self.state.lock().expect("sim lock");
        f(&mut state.fleet_mut(color).knobs);
    }

    pub fn desired(&self, color: Color) -> u32 {
        self.state.lock().expect("sim lock").fleet(color).desired
    }

    /// Every accepted scale request, in order.
    pub fn scale_log(&self) -> Vec<(Color, u32)> {
        self.state.lock().expect("sim lock").scale_log.clone()
    }

    fn status(&self, color: Color) -> FleetStatus {
        let state = self.state.lock().expect("sim lock");
        let fleet = state.fleet(color);
        let now = Instant::now();
        let in_service = fleet.instances.iter().filter(|i| i.in_service(now)).count() as u32;
        FleetStatus {
            desired: fleet.desired,
            in_service,
            pending: fleet.instances.iter().filter(|i| i.pending(now)).count() as u32,
            unhealthy: if fleet.knobs.failing_health_checks { in_service } else { 0 },
            failed_launches: fleet.instances.iter().filter(|i| i.failed(now)).count() as u32,
        }
    }

    fn color_of_target_group(&self, tg: &TargetGroupRef) -> Result<Color, SignalError> {
        self.env
            .target_groups
            .color_of(tg)
            .ok_or_else(|| SignalError::UnknownTarget(tg.to_string()))
    }

    fn apply_scale(&self, color: Color, desired: u32) -> Result<(), FleetError> {
        let mut state = self.state.lock().expect("sim lock");
        if state.throttled_scales > 0 {
            state.throttled_scales -= 1;
            return Err(FleetError::Transient("rate exceeded".into()));
        }
        if desired > self.env.max_size {
            return Err(FleetError::Fatal(format!(
                "desired capacity {desired} exceeds max size {}",
                self.env.max_size
            )));
        }
        if let Some(quota) = state.quota
            && desired > quota
        {
            return Err(FleetError::Fatal(format!(
                "instance quota exceeded: requested {desired}, limit {quota}"
            )));
        }

        let ready_at = Instant::now() + state.boot_time;
        state.scale_log.push((color, desired));
        let fleet = state.fleet_mut(color);
        let doomed = fleet.knobs.fail_launches;
        // A capacity change replaces terminally failed launches.
        let now = Instant::now();
        fleet.instances.retain(|i| !i.failed(now));
        let current = fleet.instances.len() as u32;
        if desired > current {
            fleet
                .instances
                .extend((current..desired).map(|_| Instance { ready_at, doomed }));
        } else {
            fleet.instances.truncate(desired as usize);
        }
        fleet.desired = desired;
        Ok(())
    }
}

impl FleetManager for SimulatedCloud {
    fn scale(&self, color: Color, desired_capacity: u32) -> BoxFuture<'_, Result<(), FleetError>> {
        Box::pin(async move {
            match self.apply_scale(color, desired_capacity) {
                Ok(()) => {
                    info!(
                        environment = %self.env.name,
                        fleet = self.env.fleet_name(color),
                        desired_capacity,
                        "fleet capacity set"
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!(environment = %self.env.name, %color, error = %e, "scale rejected");
                    Err(e)
                }
            }
        })
    }

    fn describe(&self, color: Color) -> BoxFuture<'_, Result<FleetStatus, FleetError>> {
        Box::pin(async move { Ok(self.status(color)) })
    }
}

impl MetricsSource for SimulatedCloud {
    fn target_health<'a>(
        &'a self,
        target_group: &'a TargetGroupRef,
    ) -> BoxFuture<'a, Result<TargetHealth, SignalError>> {
        Box::pin(async move {
            let color = self.color_of_target_group(target_group)?;
            self.state.lock().expect("sim lock").take_signal_outage()?;
            let status = self.status(color);
            Ok(TargetHealth {
                healthy: status.in_service - status.unhealthy,
                unhealthy: status.unhealthy,
                initial: status.pending,
            })
        })
    }

    fn traffic<'a>(
        &'a self,
        target_group: &'a TargetGroupRef,
    ) -> BoxFuture<'a, Result<TrafficSample, SignalError>> {
        Box::pin(async move {
            let color = self.color_of_target_group(target_group)?;
            let in_service = self.status(color).in_service;
            let mut state = self.state.lock().expect("sim lock");
            state.take_signal_outage()?;
            let knobs = &state.fleet(color).knobs;
            Ok(TrafficSample {
                request_count: in_service as u64 * knobs.requests_per_instance,
                error_rate: knobs.error_rate,
                p99_latency_ms: knobs.p99_latency_ms,
            })
        })
    }

    fn fleet_metric<'a>(
        &'a self,
        fleet: &'a str,
        policy: &'a ScalingPolicy,
    ) -> BoxFuture<'a, Result<Option<f64>, SignalError>> {
        Box::pin(async move {
            let color = self
                .env
                .fleets
                .color_of(&fleet.to_string())
                .ok_or_else(|| SignalError::UnknownTarget(fleet.to_string()))?;
            if self.status(color).in_service == 0 {
                return Ok(None);
            }
            let state = self.state.lock().expect("sim lock");
            let value = match policy {
                ScalingPolicy::CpuTarget { .. } => state.fleet(color).knobs.cpu_percent,
                ScalingPolicy::BacklogPerInstance { .. } => state.queue_depth,
            };
            debug!(fleet, value, "fleet metric sampled");
            Ok(Some(value))
        })
    }
}
