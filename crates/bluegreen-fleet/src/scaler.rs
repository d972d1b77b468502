//! Steady-state scaler: applies each environment's scaling policy to its
//! active color between deployments.
//!
//! Reads the deployment record to find the active color, samples the
//! policy's metric, and emits scaling decisions. Environments with a
//! transition in progress are skipped: the orchestrator owns both fleets
//! until it releases the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use bluegreen_core::{EnvironmentConfig, MetricsSource, ScalingPolicy};
use bluegreen_state::StateStore;

use crate::manager::{FleetManager, FleetStatus};

/// A scaling decision for the active fleet of one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified instance count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Everything the scaler needs to manage one environment.
#[derive(Clone)]
pub struct ScalingTarget {
    pub config: EnvironmentConfig,
    pub fleet: Arc<dyn FleetManager>,
    pub metrics: Arc<dyn MetricsSource>,
}

/// The scaler evaluates metrics and decides whether to scale the active
/// color of each environment up or down.
pub struct Scaler {
    state: StateStore,
    targets: Vec<ScalingTarget>,
    /// Last scale-in per environment (cooldown tracking).
    last_scale_in: HashMap<String, Instant>,
}

impl Scaler {
    pub fn new(state: StateStore, targets: Vec<ScalingTarget>) -> Self {
        Self {
            state,
            targets,
            last_scale_in: HashMap::new(),
        }
    }

    /// Decide the desired capacity for an environment's active fleet.
    ///
    /// `metric` is the raw policy metric: average CPU percent, or total
    /// queue depth for backlog-per-instance policies.
    pub fn evaluate(
        &mut self,
        env: &EnvironmentConfig,
        status: &FleetStatus,
        metric: f64,
    ) -> ScaleDecision {
        let current = status.in_service;
        if current == 0 {
            // Nothing to measure against until instances come into service.
            return ScaleDecision::NoChange;
        }

        let per_instance = match &env.scaling_policy {
            ScalingPolicy::CpuTarget { .. } => metric,
            ScalingPolicy::BacklogPerInstance { .. } => metric / current as f64,
        };
        let target = env.scaling_policy.target();
        let ratio = per_instance / target;
        let floor = env.min_size.max(1);

        // Scale out: 10% headroom, no cooldown.
        if ratio > 1.1 {
            let desired = ((current as f64) * ratio).ceil() as u32;
            let clamped = desired.min(env.max_size);
            if clamped > current {
                debug!(
                    environment = %env.name,
                    from = current,
                    to = clamped,
                    per_instance,
                    target,
                    "scaling out"
                );
                return ScaleDecision::ScaleTo(clamped);
            }
        }

        // Scale in: well below target and outside the cooldown.
        if ratio < 0.5 && current > floor {
            let now = Instant::now();
            let cooled = self
                .last_scale_in
                .get(&env.name)
                .is_none_or(|last| now.duration_since(*last) >= env.default_cooldown);
            if !cooled {
                debug!(environment = %env.name, "scale-in suppressed by cooldown");
                return ScaleDecision::NoChange;
            }

            let desired = ((current as f64) * ratio).ceil() as u32;
            let clamped = desired.max(floor);
            if clamped < current {
                self.last_scale_in.insert(env.name.clone(), now);
                debug!(
                    environment = %env.name,
                    from = current,
                    to = clamped,
                    per_instance,
                    target,
                    "scaling in"
                );
                return ScaleDecision::ScaleTo(clamped);
            }
        }

        ScaleDecision::NoChange
    }

    /// Evaluate every environment once and apply the decisions.
    pub async fn evaluate_all(&mut self) -> Vec<(String, ScaleDecision)> {
        let mut decisions = Vec::new();
        let targets = self.targets.clone();

        for target in &targets {
            let env = &target.config;
            let record = match self.state.get(&env.name) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(environment = %env.name, error = %e, "failed to read deployment record");
                    continue;
                }
            };
            if record.transition_in_progress {
                debug!(environment = %env.name, "transition in progress, not scaling");
                continue;
            }

            let color = record.active_color;
            let status = match target.fleet.describe(color).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(environment = %env.name, %color, error = %e, "describe failed");
                    continue;
                }
            };
            let metric = match target
                .metrics
                .fleet_metric(env.fleet_name(color), &env.scaling_policy)
                .await
            {
                Ok(Some(value)) => value,
                Ok(None) => continue, // No datapoint yet.
                Err(e) => {
                    warn!(environment = %env.name, error = %e, "scaling metric unavailable");
                    continue;
                }
            };

            let decision = self.evaluate(env, &status, metric);
            if let ScaleDecision::ScaleTo(desired) = decision
                && let Err(e) = target.fleet.scale(color, desired).await
            {
                warn!(
                    environment = %env.name,
                    %color,
                    desired,
                    error = %e,
                    "scaling action failed"
                );
            }
            decisions.push((env.name.clone(), decision));
        }

        decisions
    }

    /// Run the scaler loop until shutdown.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "steady-state scaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.evaluate_all().await;
                }
                _ = shutdown.changed() => {
                    info!("steady-state scaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bluegreen_core::{
        BlueGreenConfig, BoxFuture, Color, SignalError, TargetGroupRef, TargetHealth, TrafficSample,
    };
    use bluegreen_state::DeploymentRecord;

    use crate::manager::FleetError;

    const CONFIG: &str = r#"
[[environment]]
name = "prod"
launch_template = "lt-prod:1"
min_size = 2
max_size = 10
working_capacity = 4
health_check_grace_period = "5m"
default_cooldown = "3m"
fleets = { blue = "prod-blue", green = "prod-green" }
target_groups = { blue = "tg-prod-blue", green = "tg-prod-green" }
scaling_policy = { type = "cpu_target", target_percent = 50.0 }

[[environment]]
name = "queue"
launch_template = "lt-queue:1"
min_size = 1
max_size = 24
working_capacity = 2
health_check_grace_period = "5m"
default_cooldown = "3m"
fleets = { blue = "queue-blue", green = "queue-green" }
target_groups = { blue = "tg-queue-blue", green = "tg-queue-green" }
scaling_policy = { type = "backlog_per_instance", queue = "jobs", target_per_instance = 3.0 }
"#;

    fn env(name: &str) -> EnvironmentConfig {
        BlueGreenConfig::from_toml_str(CONFIG)
            .unwrap()
            .environment(name)
            .unwrap()
            .clone()
    }

    fn in_service(n: u32) -> FleetStatus {
        FleetStatus {
            desired: n,
            in_service: n,
            ..Default::default()
        }
    }

    fn scaler() -> Scaler {
        Scaler::new(StateStore::open_in_memory().unwrap(), Vec::new())
    }

    #[test]
    fn cpu_above_target_scales_out() {
        let mut s = scaler();
        // 80% against a 50% target with 4 instances -> ceil(4 * 1.6) = 7.
        assert_eq!(s.evaluate(&env("prod"), &in_service(4), 80.0), ScaleDecision::ScaleTo(7));
    }

    #[test]
    fn scale_out_respects_max_size() {
        let mut s = scaler();
        assert_eq!(s.evaluate(&env("prod"), &in_service(8), 100.0), ScaleDecision::ScaleTo(10));
    }

    #[test]
    fn near_target_is_no_change() {
        let mut s = scaler();
        assert_eq!(s.evaluate(&env("prod"), &in_service(4), 52.0), ScaleDecision::NoChange);
    }

    #[test]
    fn scale_in_respects_min_size() {
        let mut s = scaler();
        assert_eq!(s.evaluate(&env("prod"), &in_service(6), 5.0), ScaleDecision::ScaleTo(2));
    }

    #[test]
    fn backlog_policy_divides_by_in_service() {
        let mut s = scaler();
        // 30 queued jobs over 2 instances = 15 per instance, target 3 -> 10.
        assert_eq!(s.evaluate(&env("queue"), &in_service(2), 30.0), ScaleDecision::ScaleTo(10));
    }

    #[test]
    fn no_instances_means_no_decision() {
        let mut s = scaler();
        assert_eq!(s.evaluate(&env("queue"), &in_service(0), 300.0), ScaleDecision::NoChange);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_in_waits_for_cooldown() {
        let mut s = scaler();
        let prod = env("prod");

        assert_eq!(s.evaluate(&prod, &in_service(8), 10.0), ScaleDecision::ScaleTo(2));
        // Still idle, but inside the 3m cooldown.
        assert_eq!(s.evaluate(&prod, &in_service(6), 10.0), ScaleDecision::NoChange);

        tokio::time::advance(Duration::from_secs(181)).await;
        assert_eq!(s.evaluate(&prod, &in_service(6), 10.0), ScaleDecision::ScaleTo(2));
    }

    struct StubFleet {
        status: FleetStatus,
        scaled: Mutex<Vec<(Color, u32)>>,
    }

    impl FleetManager for StubFleet {
        fn scale(&self, color: Color, desired: u32) -> BoxFuture<'_, Result<(), FleetError>> {
            self.scaled.lock().unwrap().push((color, desired));
            Box::pin(async { Ok(()) })
        }

        fn describe(&self, _color: Color) -> BoxFuture<'_, Result<FleetStatus, FleetError>> {
            let status = self.status;
            Box::pin(async move { Ok(status) })
        }
    }

    struct StubMetrics(f64);

    impl MetricsSource for StubMetrics {
        fn target_health<'a>(
            &'a self,
            _tg: &'a TargetGroupRef,
        ) -> BoxFuture<'a, Result<TargetHealth, SignalError>> {
            Box::pin(async { Ok(TargetHealth::default()) })
        }

        fn traffic<'a>(
            &'a self,
            _tg: &'a TargetGroupRef,
        ) -> BoxFuture<'a, Result<TrafficSample, SignalError>> {
            Box::pin(async { Ok(TrafficSample::default()) })
        }

        fn fleet_metric<'a>(
            &'a self,
            _fleet: &'a str,
            _policy: &'a ScalingPolicy,
        ) -> BoxFuture<'a, Result<Option<f64>, SignalError>> {
            let value = self.0;
            Box::pin(async move { Ok(Some(value)) })
        }
    }

    #[tokio::test]
    async fn evaluate_all_scales_active_color_and_skips_locked_environments() {
        let state = StateStore::open_in_memory().unwrap();
        let prod = env("prod");
        let record =
            DeploymentRecord::new("prod", Color::Green, prod.target_group(Color::Green).clone());
        state.initialize(&record).unwrap();

        let fleet = Arc::new(StubFleet {
            status: in_service(4),
            scaled: Mutex::new(Vec::new()),
        });
        let target = ScalingTarget {
            config: prod,
            fleet: fleet.clone(),
            metrics: Arc::new(StubMetrics(80.0)),
        };
        let mut s = Scaler::new(state.clone(), vec![target]);

        let decisions = s.evaluate_all().await;
        assert_eq!(decisions, vec![("prod".to_string(), ScaleDecision::ScaleTo(7))]);
        assert_eq!(*fleet.scaled.lock().unwrap(), vec![(Color::Green, 7)]);

        // Lock the environment: the scaler must keep its hands off.
        let current = state.read("prod").unwrap();
        state
            .compare_and_swap("prod", &current, &current.locked("deploy-1"))
            .unwrap();
        assert!(s.evaluate_all().await.is_empty());
        assert_eq!(fleet.scaled.lock().unwrap().len(), 1);
    }
}
