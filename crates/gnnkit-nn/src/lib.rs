//! Message-passing layers and neighborhood statistics for graph neural networks.
//!
//! A node is defined by its neighborhood. Every layer here follows the
//! message-passing pattern:
//!
//! ```text
//! h_i^{(l+1)} = UPDATE(h_i^{(l)}, AGGREGATE({MESSAGE(h_j^{(l)}) : j ∈ N(i)}))
//! ```
//!
//! and differs only in how the three steps are defined.
//!
//! # Modules
//!
//! - [`aggregation`]: PNA reducers (mean, sum, max, min, std, var, moments)
//!   and degree scalers (identity, amplification, attenuation)
//! - [`graph`]: Edge-indexed graph structure consumed by the layers
//! - [`layers`]: GIN, GAT and PNA-simple layers behind one [`MessagePassing`] contract
//!
//! # Example: GIN forward pass
//!
//! ```rust,ignore
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use gnnkit_nn::{build_layer, Graph, LayerConfig, MessagePassing};
//!
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//!
//! let graph = Graph::from_edges(3, &[(0, 1), (1, 2), (2, 0)], &device)?;
//! let layer = build_layer(&LayerConfig::new("gin", 16, 32)?, vb)?;
//!
//! let h = Tensor::randn(0f32, 1f32, (3, 16), &device)?;
//! let out = layer.forward_t(&graph, &h, true)?; // (3, 32)
//! ```

pub mod aggregation;
pub mod error;
pub mod graph;
pub mod layers;

pub use aggregation::{AverageDegree, Aggregator, Scaler, EPS};
pub use error::{Error, Result};
pub use graph::{DegreeBucket, Graph};
pub use layers::{
    build_layer, Activation, GatLayer, GinLayer, Layer, LayerBase, LayerConfig, LayerKind,
    LayerOptions, MessagePassing, PnaLayer, PostProcess,
};
