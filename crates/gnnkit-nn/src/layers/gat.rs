use candle_core::{Tensor, D};
use candle_nn::{init, linear_no_bias, Init, Linear, Module, VarBuilder};

use super::{dropout_t, Activation, LayerBase, MessagePassing, PostProcess};
use crate::error::{Error, Result};
use crate::graph::Graph;

/// Graph Attention Network layer.
///
/// Implements attention-weighted aggregation per head k:
///
/// ```text
/// h_i^k = Σ_{j∈N(i)} α_ij^k W^k h_j
/// α_ij^k = softmax_j(LeakyReLU(a_src^k · W^k h_j + a_dst^k · W^k h_i))
/// ```
///
/// The softmax runs over the incoming edges of each destination node,
/// separately per head. Head outputs are concatenated, so the layer emits
/// `out_dim * num_heads` features and reports `num_heads` as its
/// out-dim factor.
///
/// Feature dropout (on the input) and attention dropout (on α) use the
/// layer's dropout probability. Post-processing runs batch norm and
/// activation only; dropout of the output is left to the caller.
///
/// A node with no incoming edges receives only the bias.
///
/// # Reference
///
/// Velickovic et al., "Graph Attention Networks", ICLR 2018.
pub struct GatLayer {
    base: LayerBase,
    linear: Linear,
    att_src: Tensor, // (1, heads, out)
    att_dst: Tensor, // (1, heads, out)
    bias: Tensor,    // (heads * out,)
    negative_slope: f64,
    num_heads: usize,
}

impl GatLayer {
    pub const SUPPORTS_EDGES: bool = false;
    pub const INPUTS_EDGES: bool = false;
    pub const OUTPUTS_EDGES: bool = false;

    /// Create a new GAT layer.
    ///
    /// # Arguments
    /// - `in_dim`: Input feature dimension
    /// - `out_dim`: Output feature dimension per head
    /// - `num_heads`: Number of attention heads
    /// - `activation`, `dropout`, `batch_norm`: shared post-processing
    /// - `vb`: Variable builder
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        num_heads: usize,
        activation: Activation,
        dropout: f64,
        batch_norm_enabled: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 {
            return Err(Error::InvalidConfig("GAT needs at least one head".into()));
        }
        let base = LayerBase::new(
            in_dim,
            out_dim,
            activation,
            dropout,
            batch_norm_enabled,
            out_dim * num_heads,
            vb.clone(),
        )?;

        let linear = linear_no_bias(in_dim, out_dim * num_heads, vb.pp("lin"))?;

        // Attention parameters: a = [a_src || a_dst]
        let att_src = vb.get_with_hints(
            (1, num_heads, out_dim),
            "att_src",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let att_dst = vb.get_with_hints(
            (1, num_heads, out_dim),
            "att_dst",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_dim * num_heads, "bias", Init::Const(0.0))?;

        Ok(Self {
            base,
            linear,
            att_src,
            att_dst,
            bias,
            negative_slope: 0.2,
            num_heads,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Attention coefficients `(E, heads)`, normalized over each node's incoming edges.
    fn attention(&self, graph: &Graph, z: &Tensor, n: usize) -> Result<Tensor> {
        let alpha_src = z.broadcast_mul(&self.att_src)?.sum(D::Minus1)?; // (N, heads)
        let alpha_dst = z.broadcast_mul(&self.att_dst)?.sum(D::Minus1)?;

        // e_ij = LeakyReLU(alpha_src[j] + alpha_dst[i]) for edge j -> i
        let scores = (alpha_src.index_select(graph.src(), 0)?
            + alpha_dst.index_select(graph.dst(), 0)?)?;
        let scores = candle_nn::ops::leaky_relu(&scores, self.negative_slope)?;

        // Softmax per destination, shifted by that destination's own maximum
        // so every group keeps at least one exp() term equal to 1.
        let node_max = self.incoming_max(graph, &alpha_src, &alpha_dst, n)?;
        let shift = node_max.index_select(graph.dst(), 0)?;
        let weights = (scores - shift)?.exp()?;
        let denom = Tensor::zeros((n, self.num_heads), weights.dtype(), weights.device())?
            .index_add(graph.dst(), &weights, 0)?;
        Ok((weights / denom.index_select(graph.dst(), 0)?)?)
    }

    /// Largest incoming score of every node per head `(N, heads)`, detached.
    ///
    /// Scores are recomputed bucket by bucket from the neighbor layout, so each
    /// bucket reduces a dense `(B, degree, heads)` block. Nodes without
    /// incoming edges keep 0.
    fn incoming_max(
        &self,
        graph: &Graph,
        alpha_src: &Tensor,
        alpha_dst: &Tensor,
        n: usize,
    ) -> Result<Tensor> {
        let alpha_src = alpha_src.detach();
        let alpha_dst = alpha_dst.detach();
        let device = alpha_src.device();
        let mut node_max = Tensor::zeros((n, self.num_heads), alpha_src.dtype(), device)?;

        for bucket in graph.degree_buckets() {
            let b = bucket.nodes.len();
            let neighbors = Tensor::from_slice(&bucket.neighbors, bucket.neighbors.len(), device)?;
            let nodes = Tensor::from_slice(&bucket.nodes, b, device)?;

            let src_scores = alpha_src
                .index_select(&neighbors, 0)?
                .reshape((b, bucket.degree, self.num_heads))?;
            let dst_scores = alpha_dst.index_select(&nodes, 0)?.unsqueeze(1)?;
            let scores = candle_nn::ops::leaky_relu(
                &src_scores.broadcast_add(&dst_scores)?,
                self.negative_slope,
            )?;
            node_max = node_max.index_add(&nodes, &scores.max(1)?, 0)?;
        }
        Ok(node_max)
    }
}

impl MessagePassing for GatLayer {
    fn forward_t(&self, graph: &Graph, h: &Tensor, train: bool) -> Result<Tensor> {
        self.base.check_input(graph, h)?;
        let n = h.dim(0)?;
        let out_per_head = self.base.out_dim();
        let dropout = self.base.dropout();

        let h = dropout_t(h, dropout, train)?;

        // Linear projection: (N, in) -> (N, heads, out)
        let z = self
            .linear
            .forward(&h)?
            .reshape((n, self.num_heads, out_per_head))?;

        let mut aggregated =
            Tensor::zeros((n, self.num_heads, out_per_head), z.dtype(), z.device())?;
        if graph.num_edges() > 0 {
            let alpha = self.attention(graph, &z, n)?;
            let alpha = dropout_t(&alpha, dropout, train)?;

            let messages = z
                .index_select(graph.src(), 0)?
                .broadcast_mul(&alpha.unsqueeze(2)?)?; // (E, heads, out)
            aggregated = aggregated.index_add(graph.dst(), &messages, 0)?;
        }

        let out = aggregated
            .reshape((n, self.num_heads * out_per_head))?
            .broadcast_add(&self.bias)?;

        self.base
            .apply_norm_activation_dropout(&out, train, PostProcess::NO_DROPOUT)
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

    fn out_dim_factor(&self) -> usize {
        self.num_heads
    }

    fn base(&self) -> &LayerBase {
        &self.base
    }
}
