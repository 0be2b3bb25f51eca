//! `gnnkit`: graph neural network layers and their training loop on candle.
//!
//! This crate re-exports the workspace members:
//!
//! - [`nn`] (`gnnkit-nn`): graph structure, PNA aggregators and scalers,
//!   GIN / GAT / PNA-simple layers
//! - [`train`] (`gnnkit-train`): losses, NaN target policy, metrics, epoch
//!   summaries, plateau scheduler, predictor
//!
//! and adds [`GnnRegressor`], a layer stack with a linear head that plugs
//! straight into [`Predictor`](train::Predictor).
//!
//! # Example
//!
//! ```rust,ignore
//! use gnnkit::{GnnRegressor, GnnRegressorConfig, GraphInput};
//! use gnnkit::nn::LayerConfig;
//! use gnnkit::train::{Batch, Metrics, Phase, Predictor, PredictorConfig, TracingLogger};
//!
//! let model_config = GnnRegressorConfig {
//!     layers: vec![LayerConfig::new("gin", 8, 16)?, LayerConfig::new("gin", 16, 16)?],
//!     out_dim: 1,
//! };
//! let mut predictor = Predictor::<GnnRegressor>::new(
//!     &model_config,
//!     PredictorConfig::default(),
//!     Metrics::new(),
//!     Box::new(TracingLogger::new("runs/gin")),
//!     &Device::Cpu,
//! )?;
//! predictor.on_batch(Phase::Train, Batch::new(GraphInput { graph, features }, labels))?;
//! ```

pub mod model;

pub use gnnkit_nn as nn;
pub use gnnkit_train as train;

pub use model::{GnnRegressor, GnnRegressorConfig, GraphInput};
