//! bluegreen-health — health verification and post-switch monitoring.
//!
//! Both halves only observe: they read fleet snapshots and target-group
//! signals and never scale a fleet or touch routing.
//!
//! # Architecture
//!
//! ```text
//! HealthVerifier::await_healthy (before the switch)
//!   ├── FleetManager::describe → in-service / failed launches
//!   ├── MetricsSource::target_health → passing targets
//!   └── Healthy | Timeout | Unhealthy
//!
//! RegressionMonitor::watch (after the switch)
//!   ├── MetricsSource::target_health + traffic, every `interval`
//!   ├── RegressionTracker (consecutive bad samples)
//!   └── Stable | Regressed
//! ```

pub mod monitor;
pub mod tracker;
pub mod verifier;

pub use monitor::{MonitorVerdict, RegressionMonitor};
pub use tracker::{RegressionTracker, SampleVerdict};
pub use verifier::{HealthOutcome, HealthVerifier};
