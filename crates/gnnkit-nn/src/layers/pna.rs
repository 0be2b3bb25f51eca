use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

use super::{Activation, LayerBase, MessagePassing, PostProcess};
use crate::aggregation::{Aggregator, AverageDegree, Scaler};
use crate::error::{Error, Result};
use crate::graph::Graph;

/// Simplified PNA layer: several aggregators, degree scalers, one linear post-transform.
///
/// ```text
/// m_v = [S(D_v) · A(h_u : u ∈ N(v))  for S in scalers, A in aggregators]
/// h_v' = W [h_v || m_v]
/// ```
///
/// Neighborhoods are processed one in-degree bucket at a time, so every
/// mailbox is a dense `(B, D, F)` tensor and the scalers see a single degree.
/// Nodes without incoming edges contribute zeros to `m_v`; this also keeps
/// attenuation away from its `D = 0` pole.
pub struct PnaLayer {
    base: LayerBase,
    aggregators: Vec<Aggregator>,
    scalers: Vec<Scaler>,
    avg_d: AverageDegree,
    posttrans: Linear,
}

impl PnaLayer {
    pub const SUPPORTS_EDGES: bool = false;
    pub const INPUTS_EDGES: bool = false;
    pub const OUTPUTS_EDGES: bool = false;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        dropout: f64,
        batch_norm_enabled: bool,
        aggregators: Vec<Aggregator>,
        scalers: Vec<Scaler>,
        avg_d: AverageDegree,
        vb: VarBuilder,
    ) -> Result<Self> {
        if aggregators.is_empty() || scalers.is_empty() {
            return Err(Error::InvalidConfig(
                "PNA needs at least one aggregator and one scaler".into(),
            ));
        }
        if !(avg_d.log.is_finite() && avg_d.log > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "average log-degree must be positive, got {}",
                avg_d.log
            )));
        }

        let base = LayerBase::new(
            in_dim,
            out_dim,
            activation,
            dropout,
            batch_norm_enabled,
            out_dim,
            vb.clone(),
        )?;
        let pooled_dim = in_dim * aggregators.len() * scalers.len();
        let posttrans = linear(in_dim + pooled_dim, out_dim, vb.pp("posttrans"))?;

        Ok(Self {
            base,
            aggregators,
            scalers,
            avg_d,
            posttrans,
        })
    }

    pub fn aggregators(&self) -> &[Aggregator] {
        &self.aggregators
    }

    pub fn scalers(&self) -> &[Scaler] {
        &self.scalers
    }

    /// Aggregated and scaled neighborhood features, `(N, in_dim * |aggregators| * |scalers|)`.
    pub fn pool(&self, graph: &Graph, h: &Tensor) -> Result<Tensor> {
        self.base.check_input(graph, h)?;
        let n = h.dim(0)?;
        let f = self.base.in_dim();
        let width = f * self.aggregators.len() * self.scalers.len();

        let mut pooled = Tensor::zeros((n, width), h.dtype(), h.device())?;
        for bucket in graph.degree_buckets() {
            let b = bucket.nodes.len();
            let neighbors = Tensor::from_slice(&bucket.neighbors, bucket.neighbors.len(), h.device())?;
            let mailbox = h.index_select(&neighbors, 0)?.reshape((b, bucket.degree, f))?;

            let aggregated = self
                .aggregators
                .iter()
                .map(|a| a.apply(&mailbox))
                .collect::<Result<Vec<_>>>()?;
            let aggregated = Tensor::cat(&aggregated, 1)?;

            let degree = bucket.degree as f64;
            let scaled = self
                .scalers
                .iter()
                .map(|s| s.apply(&aggregated, degree, &self.avg_d))
                .collect::<Result<Vec<_>>>()?;
            let scaled = Tensor::cat(&scaled, 1)?;

            let nodes = Tensor::from_slice(&bucket.nodes, b, h.device())?;
            pooled = pooled.index_add(&nodes, &scaled, 0)?;
        }
        Ok(pooled)
    }
}

impl MessagePassing for PnaLayer {
    fn forward_t(&self, graph: &Graph, h: &Tensor, train: bool) -> Result<Tensor> {
        let pooled = self.pool(graph, h)?;
        let combined = Tensor::cat(&[h, &pooled], 1)?;
        let out = self.posttrans.forward(&combined)?;
        self.base.apply_norm_activation_dropout(&out, train, PostProcess::ALL)
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

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer(aggregators: Vec<Aggregator>, scalers: Vec<Scaler>, avg_log: f64) -> Result<PnaLayer> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        PnaLayer::new(2, 3, Activation::Relu, 0.0, false, aggregators, scalers, AverageDegree::new(avg_log), vb)
    }

    #[test]
    fn test_pna_forward_shape() {
        let device = Device::Cpu;
        let pna = layer(Aggregator::ALL.to_vec(), Scaler::ALL.to_vec(), 1.0).unwrap();

        let graph = Graph::from_edges(5, &[(0, 1), (2, 1), (3, 1), (1, 0), (4, 3)], &device).unwrap();
        let x = Tensor::randn(0f32, 1f32, (5, 2), &device).unwrap();

        let pooled = pna.pool(&graph, &x).unwrap();
        assert_eq!(pooled.dims(), &[5, 2 * 9 * 3]);

        let out = pna.forward_t(&graph, &x, true).unwrap();
        assert_eq!(out.dims(), &[5, 3]);
    }

    #[test]
    fn test_pool_matches_manual_scaling() {
        let device = Device::Cpu;
        let avg_log = 2f64.ln();
        let pna = layer(vec![Aggregator::Sum, Aggregator::Max], vec![Scaler::Identity, Scaler::Amplification], avg_log).unwrap();

        // node 0 <- {1, 2, 3}: degree 3 -> amplification ln4/ln2 = 2
        let graph = Graph::from_edges(4, &[(1, 0), (2, 0), (3, 0)], &device).unwrap();
        let x = Tensor::new(&[[0f32, 0.0], [1.0, 5.0], [2.0, -1.0], [3.0, 0.0]], &device).unwrap();

        let pooled = pna.pool(&graph, &x).unwrap().to_vec2::<f32>().unwrap();
        // [sum(2) | max(2)] under identity, then the same doubled
        let expected = [6.0, 4.0, 3.0, 5.0, 12.0, 8.0, 6.0, 10.0];
        for (got, want) in pooled[0].iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "got {:?}", pooled[0]);
        }
        // isolated nodes pool to zero
        assert!(pooled[1].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pna_rejects_bad_config() {
        assert!(layer(vec![], vec![Scaler::Identity], 1.0).is_err());
        assert!(layer(vec![Aggregator::Mean], vec![], 1.0).is_err());
        assert!(layer(vec![Aggregator::Mean], vec![Scaler::Attenuation], 0.0).is_err());
    }
}
