//! Error types for gnnkit-train.

use thiserror::Error;

/// gnnkit-train error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Error raised by a layer or graph operation.
    #[error(transparent)]
    Nn(#[from] gnnkit_nn::Error),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Name not present in a registry (loss, summary mode).
    #[error("unknown {kind}: {name:?}")]
    UnknownName { kind: &'static str, name: String },

    /// Results requested for a phase that was never recorded.
    #[error("no results recorded for phase {0:?}")]
    PhaseNotFound(String),

    /// Monitored or requested metric missing from a metric map.
    #[error("metric {0:?} not found")]
    MetricNotFound(String),

    /// Lifecycle hook called out of order.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Report write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Report serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
