//! environments.toml configuration parser.
//!
//! One `[[environment]]` table per deployment target. Per-environment
//! variation (fleet sizes, grace periods, cooldowns, scaling policy,
//! spot/mixed-instance preferences) lives here as data so the orchestrator
//! runs the same logic for every environment.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::duration;
use crate::error::ConfigError;
use crate::types::{Color, TargetGroupRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueGreenConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default, rename = "environment")]
    pub environments: Vec<EnvironmentConfig>,
}

/// Settings shared by every environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Health verifier poll interval. Clamped below each environment's
    /// grace period.
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// How many times a stale-read lock conflict is re-read and retried.
    pub lock_retries: u32,
    pub routing_retry: BackoffConfig,
    pub fleet_retry: BackoffConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            lock_retries: 3,
            routing_retry: BackoffConfig::default(),
            fleet_retry: BackoffConfig::default(),
        }
    }
}

/// A value held once per color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorPair<T> {
    pub blue: T,
    pub green: T,
}

impl<T> ColorPair<T> {
    pub fn get(&self, color: Color) -> &T {
        match color {
            Color::Blue => &self.blue,
            Color::Green => &self.green,
        }
    }
}

impl<T: PartialEq> ColorPair<T> {
    /// Which color holds `value`, if any.
    pub fn color_of(&self, value: &T) -> Option<Color> {
        Color::ALL.into_iter().find(|c| self.get(*c) == value)
    }
}

/// Steady-state scaling policy applied to the active fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalingPolicy {
    /// Keep average CPU utilisation near `target_percent`.
    CpuTarget { target_percent: f64 },
    /// Keep `queue depth / in-service instances` near `target_per_instance`.
    BacklogPerInstance {
        queue: String,
        target_per_instance: f64,
    },
}

impl ScalingPolicy {
    pub fn target(&self) -> f64 {
        match self {
            ScalingPolicy::CpuTarget { target_percent } => *target_percent,
            ScalingPolicy::BacklogPerInstance {
                target_per_instance,
                ..
            } => *target_per_instance,
        }
    }
}

/// Spot/on-demand instance mix for a fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedInstancesPolicy {
    /// Instance types in preference order.
    pub instance_types: Vec<String>,
    #[serde(default)]
    pub on_demand_base_capacity: u32,
    #[serde(default)]
    pub on_demand_percentage_above_base: u32,
    #[serde(default)]
    pub spot_allocation_strategy: Option<String>,
}

/// Post-switch regression detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorPolicy {
    /// Length of the observation window. Zero disables monitoring.
    #[serde(with = "duration")]
    pub window: Duration,
    /// Sampling interval within the window.
    #[serde(with = "duration")]
    pub interval: Duration,
    /// Maximum tolerated error rate (percent).
    pub max_error_rate: f64,
    pub max_p99_latency_ms: u64,
    /// Minimum fraction of registered targets passing health checks.
    pub min_healthy_ratio: f64,
    /// Consecutive bad samples that count as a regression.
    pub unhealthy_threshold: u32,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(180),
            interval: Duration::from_secs(10),
            max_error_rate: 5.0,
            max_p99_latency_ms: 2000,
            min_healthy_ratio: 0.8,
            unhealthy_threshold: 3,
        }
    }
}

/// A named deployment target owning a blue and a green fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Launch template / image reference. Shared by both colors.
    pub launch_template: String,
    pub min_size: u32,
    pub max_size: u32,
    /// Desired capacity of a color while it is active or standing by.
    pub working_capacity: u32,
    /// Healthy instances required before traffic moves. Defaults to `min_size`.
    #[serde(default)]
    pub min_healthy: Option<u32>,
    #[serde(with = "duration")]
    pub health_check_grace_period: Duration,
    /// Scale-in cooldown for the steady-state scaling policy.
    #[serde(with = "duration")]
    pub default_cooldown: Duration,
    /// Wait before scaling the old color to zero. Defaults to `default_cooldown`.
    #[serde(default, with = "duration::option")]
    pub deregistration_delay: Option<Duration>,
    /// Active color recorded when the environment is first initialised.
    #[serde(default)]
    pub initial_color: Color,
    pub fleets: ColorPair<String>,
    pub target_groups: ColorPair<TargetGroupRef>,
    pub scaling_policy: ScalingPolicy,
    #[serde(default)]
    pub mixed_instances: Option<MixedInstancesPolicy>,
    #[serde(default)]
    pub monitor: MonitorPolicy,
}

impl EnvironmentConfig {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn fleet_name(&self, color: Color) -> &str {
        self.fleets.get(color)
    }

    pub fn target_group(&self, color: Color) -> &TargetGroupRef {
        self.target_groups.get(color)
    }

    /// Healthy-instance threshold for the health verifier (never below 1).
    pub fn min_healthy_count(&self) -> u32 {
        self.min_healthy.unwrap_or(self.min_size).max(1)
    }

    pub fn drain_delay(&self) -> Duration {
        self.deregistration_delay.unwrap_or(self.default_cooldown)
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            environment: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name must not be empty"));
        }
        if self.min_size > self.max_size {
            return Err(self.invalid(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.working_capacity == 0 {
            return Err(self.invalid("working_capacity must be at least 1"));
        }
        if self.working_capacity < self.min_size || self.working_capacity > self.max_size {
            return Err(self.invalid(format!(
                "working_capacity {} outside [{}, {}]",
                self.working_capacity, self.min_size, self.max_size
            )));
        }
        if self.min_healthy_count() > self.working_capacity {
            return Err(self.invalid(format!(
                "min_healthy {} exceeds working_capacity {}",
                self.min_healthy_count(),
                self.working_capacity
            )));
        }
        if self.health_check_grace_period.is_zero() {
            return Err(self.invalid("health_check_grace_period must be non-zero"));
        }
        if self.fleets.blue == self.fleets.green {
            return Err(self.invalid("blue and green fleets must differ"));
        }
        if self.target_groups.blue == self.target_groups.green {
            return Err(self.invalid("blue and green target groups must differ"));
        }
        if self.scaling_policy.target() <= 0.0 {
            return Err(self.invalid("scaling policy target must be positive"));
        }
        if let Some(mixed) = &self.mixed_instances
            && mixed.instance_types.is_empty()
        {
            return Err(self.invalid("mixed_instances.instance_types must not be empty"));
        }
        let monitor = &self.monitor;
        if !monitor.window.is_zero() && monitor.interval.is_zero() {
            return Err(self.invalid("monitor.interval must be non-zero"));
        }
        if !(0.0..=1.0).contains(&monitor.min_healthy_ratio) {
            return Err(self.invalid("monitor.min_healthy_ratio must be within [0, 1]"));
        }
        if !(0.0..=100.0).contains(&monitor.max_error_rate) {
            return Err(self.invalid("monitor.max_error_rate must be within [0, 100]"));
        }
        if monitor.unhealthy_threshold == 0 {
            return Err(self.invalid("monitor.unhealthy_threshold must be at least 1"));
        }
        Ok(())
    }
}

impl BlueGreenConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BlueGreenConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environments.is_empty() {
            return Err(ConfigError::Empty);
        }
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.name.as_str()) {
                return Err(ConfigError::Duplicate(env.name.clone()));
            }
            env.validate()?;
        }
        Ok(())
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[orchestrator]
poll_interval = "2s"

[orchestrator.routing_retry]
initial = "500ms"
attempts = 3

[[environment]]
name = "beta"
display_name = "Beta"
launch_template = "lt-compiler-node:42"
min_size = 1
max_size = 4
working_capacity = 2
health_check_grace_period = "5m"
default_cooldown = "3m"
fleets = { blue = "beta-blue", green = "beta-green" }
target_groups = { blue = "tg-beta-blue", green = "tg-beta-green" }
scaling_policy = { type = "cpu_target", target_percent = 50.0 }

[[environment]]
name = "gpu"
launch_template = "lt-gpu-node:7"
min_size = 2
max_size = 8
working_capacity = 2
min_healthy = 2
health_check_grace_period = "10m"
default_cooldown = "5m"
deregistration_delay = "45s"
initial_color = "green"
fleets = { blue = "gpu-blue", green = "gpu-green" }
target_groups = { blue = "tg-gpu-blue", green = "tg-gpu-green" }

[environment.scaling_policy]
type = "backlog_per_instance"
queue = "gpu-compilation-queue"
target_per_instance = 3.0

[environment.mixed_instances]
instance_types = ["g4dn.xlarge", "g4dn.2xlarge"]
on_demand_base_capacity = 1
spot_allocation_strategy = "price-capacity-optimized"

[environment.monitor]
window = "2m"
max_error_rate = 2.5
"#;

    #[test]
    fn parses_sample() {
        let config = BlueGreenConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.environments.len(), 2);
        assert_eq!(config.orchestrator.poll_interval, Duration::from_secs(2));
        assert_eq!(config.orchestrator.routing_retry.initial, Duration::from_millis(500));
        assert_eq!(config.orchestrator.routing_retry.attempts, 3);
        // Unset fields keep their defaults.
        assert_eq!(config.orchestrator.routing_retry.max, Duration::from_secs(30));

        let beta = config.environment("beta").unwrap();
        assert_eq!(beta.label(), "Beta");
        assert_eq!(beta.initial_color, Color::Blue);
        assert_eq!(beta.min_healthy_count(), 1);
        assert_eq!(beta.drain_delay(), Duration::from_secs(180));
        assert_eq!(beta.monitor, MonitorPolicy::default());

        let gpu = config.environment("gpu").unwrap();
        assert_eq!(gpu.label(), "gpu");
        assert_eq!(gpu.initial_color, Color::Green);
        assert_eq!(gpu.drain_delay(), Duration::from_secs(45));
        assert_eq!(gpu.monitor.window, Duration::from_secs(120));
        assert_eq!(gpu.monitor.max_error_rate, 2.5);
        assert_eq!(gpu.monitor.unhealthy_threshold, 3);
        assert!(matches!(
            gpu.scaling_policy,
            ScalingPolicy::BacklogPerInstance { target_per_instance, .. }
                if target_per_instance == 3.0
        ));
        assert_eq!(gpu.mixed_instances.as_ref().unwrap().instance_types.len(), 2);
    }

    #[test]
    fn color_pair_lookup() {
        let config = BlueGreenConfig::from_toml_str(SAMPLE).unwrap();
        let beta = config.environment("beta").unwrap();
        assert_eq!(beta.target_group(Color::Green).as_str(), "tg-beta-green");
        assert_eq!(beta.fleet_name(Color::Blue), "beta-blue");
        assert_eq!(
            beta.target_groups.color_of(&TargetGroupRef::new("tg-beta-green")),
            Some(Color::Green)
        );
        assert_eq!(beta.target_groups.color_of(&TargetGroupRef::new("tg-other")), None);
    }

    #[test]
    fn rejects_duplicate_names() {
        let doubled = SAMPLE.replace("name = \"gpu\"", "name = \"beta\"");
        let err = BlueGreenConfig::from_toml_str(&doubled).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(name) if name == "beta"));
    }

    #[test]
    fn rejects_working_capacity_out_of_bounds() {
        let bad = SAMPLE.replacen("working_capacity = 2", "working_capacity = 9", 1);
        let err = BlueGreenConfig::from_toml_str(&bad).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { ref environment, .. } if environment == "beta"
        ));
    }

    #[test]
    fn rejects_shared_target_group() {
        let bad = SAMPLE.replace(
            "target_groups = { blue = \"tg-beta-blue\", green = \"tg-beta-green\" }",
            "target_groups = { blue = \"tg-beta\", green = \"tg-beta\" }",
        );
        assert!(BlueGreenConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        let bad = SAMPLE.replacen("\"5m\"", "\"five minutes\"", 1);
        assert!(matches!(
            BlueGreenConfig::from_toml_str(&bad),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_empty_config() {
        assert!(matches!(
            BlueGreenConfig::from_toml_str(""),
            Err(ConfigError::Empty)
        ));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environments.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = BlueGreenConfig::from_file(&path).unwrap();
        assert!(config.environment("gpu").is_some());

        let missing = BlueGreenConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
