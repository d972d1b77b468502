pub mod backoff;
pub mod config;
pub mod duration;
pub mod error;
pub mod signal;
pub mod types;

pub use backoff::{BackoffConfig, retry};
pub use config::{
    BlueGreenConfig, ColorPair, EnvironmentConfig, MixedInstancesPolicy, MonitorPolicy,
    OrchestratorSettings, ScalingPolicy,
};
pub use error::{ConfigError, SignalError};
pub use signal::{BoxFuture, MetricsSource, TargetHealth, TrafficSample};
pub use types::{Color, TargetGroupRef, epoch_secs};
