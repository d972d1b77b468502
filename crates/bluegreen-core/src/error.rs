//! Error types shared by the blue/green crates.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating `environments.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no environments configured")]
    Empty,

    #[error("duplicate environment: {0}")]
    Duplicate(String),

    #[error("environment {environment}: {reason}")]
    Invalid { environment: String, reason: String },
}

/// Errors from the metrics/health signal source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal source unavailable: {0}")]
    Unavailable(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),
}
