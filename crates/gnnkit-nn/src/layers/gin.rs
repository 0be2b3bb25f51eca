use candle_core::Tensor;
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Init, Linear, Module, ModuleT, VarBuilder};

use super::{Activation, LayerBase, MessagePassing, PostProcess};
use crate::error::Result;
use crate::graph::Graph;

/// Graph Isomorphism Network layer.
///
/// GIN is provably as powerful as the 1-WL test: sum aggregation is injective
/// on multisets of neighbor features, where mean and max are not.
///
/// ```text
/// h_v' = MLP((1 + ε) · h_v + Σ_{u∈N(v)} w_uv · h_u)
/// ```
///
/// `w_uv` is the edge weight when the graph carries one, otherwise 1. The
/// MLP is `Linear(in, in) → [BN] → act → Linear(in, out)`, followed by the
/// shared batch norm / activation / dropout.
///
/// ε is either a learnable parameter or a fixed buffer; a fixed ε receives no
/// gradient.
///
/// # Reference
///
/// Xu et al., "How Powerful are Graph Neural Networks?", ICLR 2019.
pub struct GinLayer {
    base: LayerBase,
    mlp: [Linear; 2],
    mid_norm: Option<BatchNorm>,
    eps: Tensor,
    learn_eps: bool,
}

impl GinLayer {
    pub const SUPPORTS_EDGES: bool = false;
    pub const INPUTS_EDGES: bool = false;
    pub const OUTPUTS_EDGES: bool = false;

    /// Create a new GIN layer.
    ///
    /// # Arguments
    ///
    /// - `in_dim`, `out_dim`: feature dimensions (MLP hidden width = `in_dim`)
    /// - `activation`, `dropout`, `batch_norm`: shared post-processing
    /// - `init_eps`: initial ε
    /// - `learn_eps`: register ε as a trainable variable
    /// - `vb`: variable builder
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        dropout: f64,
        batch_norm_enabled: bool,
        init_eps: f64,
        learn_eps: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let base = LayerBase::new(
            in_dim,
            out_dim,
            activation,
            dropout,
            batch_norm_enabled,
            out_dim,
            vb.clone(),
        )?;

        let mlp = [
            linear(in_dim, in_dim, vb.pp("mlp_0"))?,
            linear(in_dim, out_dim, vb.pp("mlp_1"))?,
        ];
        let mid_norm = if batch_norm_enabled {
            Some(batch_norm(in_dim, BatchNormConfig::default(), vb.pp("mlp_bn"))?)
        } else {
            None
        };

        let eps = if learn_eps {
            vb.get_with_hints(1, "eps", Init::Const(init_eps))?
        } else {
            Tensor::new(&[init_eps], vb.device())?.to_dtype(vb.dtype())?
        };

        Ok(Self {
            base,
            mlp,
            mid_norm,
            eps,
            learn_eps,
        })
    }

    pub fn learn_eps(&self) -> bool {
        self.learn_eps
    }

    /// Current ε.
    pub fn eps(&self) -> Result<f64> {
        Ok(self.eps.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?[0])
    }

    /// Pre-MLP combination `(1 + ε) · h_v + Σ w_uv · h_u`.
    pub fn aggregate(&self, graph: &Graph, h: &Tensor) -> Result<Tensor> {
        self.base.check_input(graph, h)?;

        let neighbors = sum_neighbors(graph, h)?;
        let self_term = h.broadcast_mul(&(&self.eps + 1.0)?)?;
        Ok((self_term + neighbors)?)
    }
}

/// Σ over incoming edges of (optionally weighted) source features.
fn sum_neighbors(graph: &Graph, h: &Tensor) -> Result<Tensor> {
    let out = h.zeros_like()?;
    if graph.num_edges() == 0 {
        return Ok(out);
    }
    let mut messages = h.index_select(graph.src(), 0)?;
    if let Some(w) = graph.edge_weights() {
        let w = w.to_dtype(h.dtype())?.unsqueeze(1)?;
        messages = messages.broadcast_mul(&w)?;
    }
    Ok(out.index_add(graph.dst(), &messages, 0)?)
}

impl MessagePassing for GinLayer {
    fn forward_t(&self, graph: &Graph, h: &Tensor, train: bool) -> Result<Tensor> {
        let combined = self.aggregate(graph, h)?;

        let mut x = self.mlp[0].forward(&combined)?;
        if let Some(norm) = &self.mid_norm {
            x = norm.forward_t(&x, train)?;
        }
        x = self.base.activation().apply(&x)?;
        let x = self.mlp[1].forward(&x)?;

        self.base.apply_norm_activation_dropout(&x, train, PostProcess::ALL)
    }

    fn layer_supports_edges(&self) -> bool {
        Self::SUPPORTS_EDGES
    }

    fn layer_inputs_edges(&self) -> bool {
        Self::INPUTS_EDGES
    }

    fn layer_outputs_edges(&self) -> bool {
        Self::OUTPUTS_EDGES
    }

    fn base(&self) -> &LayerBase {
        &self.base
    }
}
