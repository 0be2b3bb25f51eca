//! Edge-indexed graph structure.
//!
//! A [`Graph`] owns the connectivity of one (possibly batched) graph: the
//! source/destination index tensors used by message passing, optional edge
//! weights and edge features, and the in-degree buckets used by degree-aware
//! layers. Node features are never stored on the graph; layers take them as a
//! separate tensor and return a new one.

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Nodes sharing the same in-degree, with their incoming neighbors laid out
/// row-major (`nodes.len() * degree` entries).
#[derive(Debug, Clone)]
pub struct DegreeBucket {
    /// In-degree shared by every node in the bucket (always >= 1).
    pub degree: usize,
    /// Destination node ids.
    pub nodes: Vec<u32>,
    /// Source node ids, `degree` per destination node.
    pub neighbors: Vec<u32>,
}

/// Directed graph stored as an edge list.
///
/// Edge `k` sends a message from `src[k]` to `dst[k]`. Undirected graphs are
/// represented with both directions present.
#[derive(Debug, Clone)]
pub struct Graph {
    num_nodes: usize,
    src: Tensor,
    dst: Tensor,
    in_degrees: Vec<usize>,
    buckets: Vec<DegreeBucket>,
    edge_weights: Option<Tensor>,
    edge_features: Option<Tensor>,
}

impl Graph {
    /// Build a graph from `(src, dst)` pairs.
    ///
    /// Fails if any endpoint is `>= num_nodes`.
    pub fn from_edges(num_nodes: usize, edges: &[(usize, usize)], device: &Device) -> Result<Self> {
        let mut in_degrees = vec![0usize; num_nodes];
        let mut incoming: Vec<Vec<u32>> = vec![Vec::new(); num_nodes];
        let mut src = Vec::with_capacity(edges.len());
        let mut dst = Vec::with_capacity(edges.len());

        for &(s, d) in edges {
            if s >= num_nodes || d >= num_nodes {
                return Err(Error::EdgeOutOfRange {
                    src: s,
                    dst: d,
                    num_nodes,
                });
            }
            src.push(s as u32);
            dst.push(d as u32);
            in_degrees[d] += 1;
            incoming[d].push(s as u32);
        }

        let buckets = bucket_by_degree(&incoming);
        let num_edges = src.len();

        Ok(Self {
            num_nodes,
            src: Tensor::from_vec(src, num_edges, device)?,
            dst: Tensor::from_vec(dst, num_edges, device)?,
            in_degrees,
            buckets,
            edge_weights: None,
            edge_features: None,
        })
    }

    /// Attach per-edge scalar weights, shape `(E,)`.
    pub fn with_edge_weights(mut self, weights: Tensor) -> Result<Self> {
        let got = weights.dim(0)?;
        if weights.rank() != 1 || got != self.num_edges() {
            return Err(Error::DimensionMismatch {
                expected: self.num_edges(),
                got,
            });
        }
        self.edge_weights = Some(weights);
        Ok(self)
    }

    /// Attach per-edge feature vectors, shape `(E, D_edge)`.
    pub fn with_edge_features(mut self, features: Tensor) -> Result<Self> {
        let got = features.dim(0)?;
        if got != self.num_edges() {
            return Err(Error::DimensionMismatch {
                expected: self.num_edges(),
                got,
            });
        }
        self.edge_features = Some(features);
        Ok(self)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.in_degrees.iter().sum()
    }

    /// Source node of every edge, `(E,)` u32.
    pub fn src(&self) -> &Tensor {
        &self.src
    }

    /// Destination node of every edge, `(E,)` u32.
    pub fn dst(&self) -> &Tensor {
        &self.dst
    }

    pub fn in_degrees(&self) -> &[usize] {
        &self.in_degrees
    }

    pub fn edge_weights(&self) -> Option<&Tensor> {
        self.edge_weights.as_ref()
    }

    pub fn edge_features(&self) -> Option<&Tensor> {
        self.edge_features.as_ref()
    }

    /// Nodes grouped by non-zero in-degree, in ascending degree order.
    ///
    /// Nodes without incoming edges appear in no bucket.
    pub fn degree_buckets(&self) -> &[DegreeBucket] {
        &self.buckets
    }

    /// Check that a node feature tensor matches this graph.
    pub(crate) fn check_features(&self, h: &Tensor) -> Result<()> {
        let got = h.dim(0)?;
        if got != self.num_nodes {
            return Err(Error::DimensionMismatch {
                expected: self.num_nodes,
                got,
            });
        }
        Ok(())
    }
}

fn bucket_by_degree(incoming: &[Vec<u32>]) -> Vec<DegreeBucket> {
    let max_degree = incoming.iter().map(Vec::len).max().unwrap_or(0);
    let mut buckets: Vec<DegreeBucket> = (0..=max_degree)
        .map(|degree| DegreeBucket {
            degree,
            nodes: Vec::new(),
            neighbors: Vec::new(),
        })
        .collect();

    for (node, neigh) in incoming.iter().enumerate() {
        let bucket = &mut buckets[neigh.len()];
        bucket.nodes.push(node as u32);
        bucket.neighbors.extend_from_slice(neigh);
    }

    buckets
        .into_iter()
        .filter(|b| b.degree > 0 && !b.nodes.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_edges_degrees() {
        let device = Device::Cpu;
        let g = Graph::from_edges(4, &[(0, 1), (2, 1), (3, 1), (1, 0)], &device).unwrap();

        assert_eq!(g.num_nodes(), 4);
        assert_eq!(g.num_edges(), 4);
        assert_eq!(g.in_degrees(), &[1, 3, 0, 0]);
        assert_eq!(g.src().to_vec1::<u32>().unwrap(), vec![0, 2, 3, 1]);
        assert_eq!(g.dst().to_vec1::<u32>().unwrap(), vec![1, 1, 1, 0]);
    }

    #[test]
    fn test_out_of_range_edge_rejected() {
        let device = Device::Cpu;
        let err = Graph::from_edges(2, &[(0, 2)], &device).unwrap_err();
        assert!(matches!(err, Error::EdgeOutOfRange { dst: 2, .. }));
    }

    #[test]
    fn test_degree_buckets_skip_isolated_nodes() {
        let device = Device::Cpu;
        // node 0 <- {1, 2}; node 1 <- {0}; node 2 <- {0}; node 3 isolated
        let g = Graph::from_edges(4, &[(1, 0), (2, 0), (0, 1), (0, 2)], &device).unwrap();
        let buckets = g.degree_buckets();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].degree, 1);
        assert_eq!(buckets[0].nodes, vec![1, 2]);
        assert_eq!(buckets[0].neighbors, vec![0, 0]);
        assert_eq!(buckets[1].degree, 2);
        assert_eq!(buckets[1].nodes, vec![0]);
        assert_eq!(buckets[1].neighbors, vec![1, 2]);
    }

    #[test]
    fn test_edge_weight_length_checked() {
        let device = Device::Cpu;
        let g = Graph::from_edges(3, &[(0, 1), (1, 2)], &device).unwrap();
        let bad = Tensor::ones(3, candle_core::DType::F32, &device).unwrap();
        assert!(matches!(
            g.with_edge_weights(bad),
            Err(Error::DimensionMismatch { expected: 2, got: 3 })
        ));
    }
}
