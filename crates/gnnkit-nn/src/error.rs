//! Error types for gnnkit-nn.

use thiserror::Error;

/// gnnkit-nn error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Edge endpoint outside the node range.
    #[error("edge ({src}, {dst}) out of range for {num_nodes} nodes")]
    EdgeOutOfRange {
        src: usize,
        dst: usize,
        num_nodes: usize,
    },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Name not present in a registry (aggregator, scaler, layer, activation).
    #[error("unknown {kind}: {name:?}")]
    UnknownName { kind: &'static str, name: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
