//! bluegreen-fleet — compute fleet management for blue/green environments.
//!
//! A `FleetManager` addresses the two color fleets of one environment. It
//! requests capacity changes (asynchronously converging) and reports
//! point-in-time instance counts. `RetryingFleet` wraps any manager and
//! retries transient API failures with exponential backoff; fatal failures
//! such as quota rejections surface immediately.
//!
//! The steady-state `Scaler` applies each environment's scaling policy to
//! the active color between deployments and stays away from any environment
//! whose deployment record shows a transition in progress.
//!
//! # Scaling Algorithm
//!
//! ```text
//! per_instance = cpu_percent                      (cpu_target)
//!              | queue_depth / in_service         (backlog_per_instance)
//! ratio        = per_instance / target
//!
//! if ratio > 1.1:                       ScaleTo(min(ceil(in_service * ratio), max_size))
//! if ratio < 0.5 and cooldown elapsed:  ScaleTo(max(ceil(in_service * ratio), min_size, 1))
//! ```

pub mod manager;
pub mod scaler;

pub use manager::{FleetError, FleetManager, FleetStatus, RetryingFleet};
pub use scaler::{ScaleDecision, Scaler, ScalingTarget};
