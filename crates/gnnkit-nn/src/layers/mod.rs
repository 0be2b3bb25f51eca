//! Message-passing layers.
//!
//! Implements:
//! - [`GinLayer`]: Graph Isomorphism Network (Xu et al., 2019)
//! - [`GatLayer`]: Graph Attention Network (Velickovic et al., 2018)
//! - [`PnaLayer`]: simplified Principal Neighbourhood Aggregation (Corso et al., 2020)
//!
//! # Shared contract
//!
//! Every layer is built from an input dimension, an output dimension, an
//! [`Activation`], a dropout probability in `[0, 1]` and a batch-norm flag,
//! and maps node features `(N, in_dim)` to `(N, out_dim * out_dim_factor)`.
//! After the layer-specific aggregation and transform, [`LayerBase`] applies
//! batch norm, then activation, then dropout; each step can be switched off
//! per call with [`PostProcess`].
//!
//! # Capability flags
//!
//! | Layer | supports edges | inputs edges | outputs edges | out-dim factor |
//! |-------|----------------|--------------|---------------|----------------|
//! | gin | false | false | false | 1 |
//! | gat | false | false | false | num_heads |
//! | pna-simple | false | false | false | 1 |
//!
//! The flags are associated constants of each layer type and never depend on
//! how an instance was configured.
//!
//! # Registry
//!
//! [`LayerKind`] maps configuration names (`"gin"`, `"gat"`, `"pna-simple"`)
//! to constructors; [`build_layer`] turns a [`LayerConfig`] into a [`Layer`].

mod gat;
mod gin;
mod pna;

pub use gat::GatLayer;
pub use gin::GinLayer;
pub use pna::PnaLayer;

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::aggregation::{Aggregator, AverageDegree, Scaler};
use crate::error::{Error, Result};
use crate::graph::Graph;

/// Nonlinearity applied after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Relu,
    Elu,
    LeakyRelu,
    Sigmoid,
    Tanh,
    Gelu,
    Silu,
    None,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Elu => "elu",
            Activation::LeakyRelu => "leaky-relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Gelu => "gelu",
            Activation::Silu => "silu",
            Activation::None => "none",
        }
    }

    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let out = match self {
            Activation::Relu => x.relu()?,
            Activation::Elu => x.elu(1.0)?,
            Activation::LeakyRelu => candle_nn::ops::leaky_relu(x, 0.01)?,
            Activation::Sigmoid => candle_nn::ops::sigmoid(x)?,
            Activation::Tanh => x.tanh()?,
            Activation::Gelu => x.gelu()?,
            Activation::Silu => x.silu()?,
            Activation::None => x.clone(),
        };
        Ok(out)
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let act = match s.to_ascii_lowercase().as_str() {
            "relu" => Activation::Relu,
            "elu" => Activation::Elu,
            "leaky-relu" | "leaky_relu" | "leakyrelu" => Activation::LeakyRelu,
            "sigmoid" => Activation::Sigmoid,
            "tanh" => Activation::Tanh,
            "gelu" => Activation::Gelu,
            "silu" => Activation::Silu,
            "none" | "linear" | "identity" => Activation::None,
            _ => {
                return Err(Error::UnknownName {
                    kind: "activation",
                    name: s.to_string(),
                })
            }
        };
        Ok(act)
    }
}

impl TryFrom<String> for Activation {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Activation> for String {
    fn from(a: Activation) -> Self {
        a.name().to_string()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which post-processing steps [`LayerBase::apply_norm_activation_dropout`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcess {
    pub batch_norm: bool,
    pub activation: bool,
    pub dropout: bool,
}

impl PostProcess {
    pub const ALL: PostProcess = PostProcess {
        batch_norm: true,
        activation: true,
        dropout: true,
    };

    /// Batch norm and activation only; the caller applies dropout.
    pub const NO_DROPOUT: PostProcess = PostProcess {
        batch_norm: true,
        activation: true,
        dropout: false,
    };
}

/// State shared by every layer: dimensions, activation, dropout, batch norm.
pub struct LayerBase {
    in_dim: usize,
    out_dim: usize,
    activation: Activation,
    dropout: f64,
    norm: Option<BatchNorm>,
}

impl LayerBase {
    /// Create the shared layer state.
    ///
    /// # Arguments
    ///
    /// - `in_dim`, `out_dim`: feature dimensions
    /// - `activation`: nonlinearity used by post-processing
    /// - `dropout`: drop probability, must lie in `[0, 1]`
    /// - `batch_norm_enabled`: whether post-processing normalizes
    /// - `norm_dim`: width of the tensor that gets normalized
    ///   (`out_dim * out_dim_factor`)
    /// - `vb`: variable builder; the norm lives under `bn`
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        dropout: f64,
        batch_norm_enabled: bool,
        norm_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        validate_dropout(dropout)?;
        let norm = if batch_norm_enabled {
            Some(batch_norm(norm_dim, BatchNormConfig::default(), vb.pp("bn"))?)
        } else {
            None
        };
        Ok(Self {
            in_dim,
            out_dim,
            activation,
            dropout,
            norm,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn dropout(&self) -> f64 {
        self.dropout
    }

    pub fn has_batch_norm(&self) -> bool {
        self.norm.is_some()
    }

    /// Batch norm, then activation, then dropout; each step gated by `steps`.
    pub fn apply_norm_activation_dropout(
        &self,
        h: &Tensor,
        train: bool,
        steps: PostProcess,
    ) -> Result<Tensor> {
        let mut h = h.clone();
        if steps.batch_norm {
            if let Some(norm) = &self.norm {
                h = norm.forward_t(&h, train)?;
            }
        }
        if steps.activation {
            h = self.activation.apply(&h)?;
        }
        if steps.dropout {
            h = dropout_t(&h, self.dropout, train)?;
        }
        Ok(h)
    }

    /// Check node features against the graph and the declared input width.
    pub(crate) fn check_input(&self, graph: &Graph, h: &Tensor) -> Result<()> {
        graph.check_features(h)?;
        let got = h.dim(1)?;
        if got != self.in_dim {
            return Err(Error::DimensionMismatch {
                expected: self.in_dim,
                got,
            });
        }
        Ok(())
    }
}

pub(crate) fn validate_dropout(p: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::InvalidConfig(format!(
            "dropout must be in [0, 1], got {p}"
        )));
    }
    Ok(())
}

/// Inverted dropout active only in training mode.
pub(crate) fn dropout_t(h: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if !train || p == 0.0 {
        return Ok(h.clone());
    }
    if p >= 1.0 {
        return Ok(h.zeros_like()?);
    }
    Ok(candle_nn::ops::dropout(h, p as f32)?)
}

/// Common contract of message-passing layers.
pub trait MessagePassing {
    /// Map node features `(N, in_dim)` to `(N, out_dim * out_dim_factor)`.
    fn forward_t(&self, graph: &Graph, h: &Tensor, train: bool) -> Result<Tensor>;

    /// Whether the layer type can consume edge features at all.
    fn layer_supports_edges(&self) -> bool;

    /// Whether this layer reads edge features as input.
    fn layer_inputs_edges(&self) -> bool;

    /// Whether this layer produces edge-level outputs.
    fn layer_outputs_edges(&self) -> bool;

    /// Factor by which the next layer's input width is multiplied.
    fn out_dim_factor(&self) -> usize {
        1
    }

    fn base(&self) -> &LayerBase;

    fn in_dim(&self) -> usize {
        self.base().in_dim()
    }

    fn out_dim(&self) -> usize {
        self.base().out_dim()
    }
}

/// Layer type names recognized by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Gin,
    Gat,
    PnaSimple,
}

impl LayerKind {
    pub const ALL: [LayerKind; 3] = [LayerKind::Gin, LayerKind::Gat, LayerKind::PnaSimple];

    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Gin => "gin",
            LayerKind::Gat => "gat",
            LayerKind::PnaSimple => "pna-simple",
        }
    }

    /// Activation the layer uses when none is configured.
    pub fn default_activation(&self) -> Activation {
        match self {
            LayerKind::Gat => Activation::Elu,
            LayerKind::Gin | LayerKind::PnaSimple => Activation::Relu,
        }
    }

    pub fn default_options(&self) -> LayerOptions {
        match self {
            LayerKind::Gin => LayerOptions::Gin {
                init_eps: 0.0,
                learn_eps: true,
            },
            LayerKind::Gat => LayerOptions::Gat { num_heads: 1 },
            LayerKind::PnaSimple => LayerOptions::PnaSimple {
                aggregators: vec![
                    Aggregator::Mean,
                    Aggregator::Max,
                    Aggregator::Min,
                    Aggregator::Std,
                ],
                scalers: vec![Scaler::Identity, Scaler::Amplification, Scaler::Attenuation],
                avg_d: AverageDegree::new(1.0),
            },
        }
    }
}

impl FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LayerKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| Error::UnknownName {
                kind: "layer",
                name: s.to_string(),
            })
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_true() -> bool {
    true
}

fn default_heads() -> usize {
    1
}

/// Layer-specific options, tagged by layer name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LayerOptions {
    Gin {
        #[serde(default)]
        init_eps: f64,
        #[serde(default = "default_true")]
        learn_eps: bool,
    },
    Gat {
        #[serde(default = "default_heads")]
        num_heads: usize,
    },
    PnaSimple {
        aggregators: Vec<Aggregator>,
        scalers: Vec<Scaler>,
        avg_d: AverageDegree,
    },
}

impl LayerOptions {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerOptions::Gin { .. } => LayerKind::Gin,
            LayerOptions::Gat { .. } => LayerKind::Gat,
            LayerOptions::PnaSimple { .. } => LayerKind::PnaSimple,
        }
    }
}

fn default_dropout() -> f64 {
    0.0
}

/// Full description of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub in_dim: usize,
    pub out_dim: usize,
    pub activation: Activation,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default)]
    pub batch_norm: bool,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl LayerConfig {
    /// Config for the named layer type with its default options.
    pub fn new(kind: &str, in_dim: usize, out_dim: usize) -> Result<Self> {
        let kind: LayerKind = kind.parse()?;
        Ok(Self {
            in_dim,
            out_dim,
            activation: kind.default_activation(),
            dropout: 0.0,
            batch_norm: false,
            options: kind.default_options(),
        })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_batch_norm(mut self, batch_norm: bool) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    pub fn with_options(mut self, options: LayerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn kind(&self) -> LayerKind {
        self.options.kind()
    }
}

/// Closed set of layer variants.
pub enum Layer {
    Gin(GinLayer),
    Gat(GatLayer),
    Pna(PnaLayer),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Gin(_) => LayerKind::Gin,
            Layer::Gat(_) => LayerKind::Gat,
            Layer::Pna(_) => LayerKind::PnaSimple,
        }
    }

    fn inner(&self) -> &dyn MessagePassing {
        match self {
            Layer::Gin(l) => l,
            Layer::Gat(l) => l,
            Layer::Pna(l) => l,
        }
    }
}

impl MessagePassing for Layer {
    fn forward_t(&self, graph: &Graph, h: &Tensor, train: bool) -> Result<Tensor> {
        self.inner().forward_t(graph, h, train)
    }

    fn layer_supports_edges(&self) -> bool {
        self.inner().layer_supports_edges()
    }

    fn layer_inputs_edges(&self) -> bool {
        self.inner().layer_inputs_edges()
    }

    fn layer_outputs_edges(&self) -> bool {
        self.inner().layer_outputs_edges()
    }

    fn out_dim_factor(&self) -> usize {
        self.inner().out_dim_factor()
    }

    fn base(&self) -> &LayerBase {
        self.inner().base()
    }
}

/// Build the layer described by `config`.
pub fn build_layer(config: &LayerConfig, vb: VarBuilder) -> Result<Layer> {
    validate_dropout(config.dropout)?;
    let layer = match &config.options {
        LayerOptions::Gin {
            init_eps,
            learn_eps,
        } => Layer::Gin(GinLayer::new(
            config.in_dim,
            config.out_dim,
            config.activation,
            config.dropout,
            config.batch_norm,
            *init_eps,
            *learn_eps,
            vb,
        )?),
        LayerOptions::Gat { num_heads } => Layer::Gat(GatLayer::new(
            config.in_dim,
            config.out_dim,
            *num_heads,
            config.activation,
            config.dropout,
            config.batch_norm,
            vb,
        )?),
        LayerOptions::PnaSimple {
            aggregators,
            scalers,
            avg_d,
        } => Layer::Pna(PnaLayer::new(
            config.in_dim,
            config.out_dim,
            config.activation,
            config.dropout,
            config.batch_norm,
            aggregators.clone(),
            scalers.clone(),
            *avg_d,
            vb,
        )?),
    };
    Ok(layer)
}
