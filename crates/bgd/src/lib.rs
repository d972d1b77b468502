//! bgd — the blue/green daemon.
//!
//! Assembles the state store, one simulated cloud per environment, the
//! orchestrator, the deployment supervisor, the steady-state scaler and the
//! REST API into a single process.

pub mod standalone;

pub use standalone::Standalone;
