//! A ready-made node-level regressor: a stack of message-passing layers
//! followed by a linear head.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use gnnkit_nn::{build_layer, Graph, Layer, LayerConfig, MessagePassing};
use gnnkit_train::{BuildModel, Error, Model, Result};

/// Layers applied in order, then a linear map to `out_dim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GnnRegressorConfig {
    pub layers: Vec<LayerConfig>,
    pub out_dim: usize,
}

/// One graph with its node features.
#[derive(Debug, Clone)]
pub struct GraphInput {
    pub graph: Graph,
    pub features: Tensor,
}

pub struct GnnRegressor {
    layers: Vec<Layer>,
    head: Linear,
}

impl GnnRegressor {
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

impl Model for GnnRegressor {
    type Input = GraphInput;

    fn forward_t(&self, input: &GraphInput, train: bool) -> Result<Tensor> {
        let mut h = input.features.clone();
        for layer in &self.layers {
            h = layer.forward_t(&input.graph, &h, train)?;
        }
        Ok(self.head.forward(&h)?)
    }
}

impl BuildModel for GnnRegressor {
    type Config = GnnRegressorConfig;

    /// Fails when the stack is empty or a layer's input width differs from
    /// the previous layer's output width (multi-head layers widen it).
    fn build(config: &GnnRegressorConfig, vb: VarBuilder) -> Result<Self> {
        if config.layers.is_empty() {
            return Err(Error::InvalidConfig("regressor needs at least one layer".into()));
        }

        let mut layers = Vec::with_capacity(config.layers.len());
        let mut width = config.layers[0].in_dim;
        for (i, layer_config) in config.layers.iter().enumerate() {
            if layer_config.in_dim != width {
                return Err(Error::Nn(gnnkit_nn::Error::DimensionMismatch {
                    expected: width,
                    got: layer_config.in_dim,
                }));
            }
            let layer = build_layer(layer_config, vb.pp(format!("layer{i}")))?;
            width = layer.out_dim() * layer.out_dim_factor();
            layers.push(layer);
        }
        let head = linear(width, config.out_dim, vb.pp("head"))?;

        Ok(Self { layers, head })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use gnnkit_nn::LayerOptions;

    #[test]
    fn test_stack_widths_follow_heads() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = GnnRegressorConfig {
            layers: vec![
                LayerConfig::new("gat", 3, 4)
                    .unwrap()
                    .with_options(LayerOptions::Gat { num_heads: 2 }),
                LayerConfig::new("gin", 8, 5).unwrap(),
            ],
            out_dim: 1,
        };
        let model = GnnRegressor::build(&config, vb).unwrap();
        assert_eq!(model.layers().len(), 2);

        let input = GraphInput {
            graph: Graph::from_edges(4, &[(0, 1), (1, 2), (2, 3), (3, 0)], &device).unwrap(),
            features: Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap(),
        };
        let out = model.forward_t(&input, false).unwrap();
        assert_eq!(out.dims(), &[4, 1]);
    }

    #[test]
    fn test_mismatched_stack_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = GnnRegressorConfig {
            layers: vec![
                LayerConfig::new("gin", 3, 4).unwrap(),
                LayerConfig::new("gin", 5, 4).unwrap(),
            ],
            out_dim: 1,
        };
        assert!(GnnRegressor::build(&config, vb.clone()).is_err());

        let empty = GnnRegressorConfig {
            layers: vec![],
            out_dim: 1,
        };
        assert!(matches!(
            GnnRegressor::build(&empty, vb),
            Err(Error::InvalidConfig(_))
        ));
    }
}
