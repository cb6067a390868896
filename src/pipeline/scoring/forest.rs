//! Isolation forest.
//!
//! An ensemble of random partitioning trees. Points that are isolated after
//! few splits are anomalous: the anomaly score is `2^(-E[h(x)] / c(ψ))`
//! where `E[h(x)]` is the mean path length over all trees and `c(ψ)` the
//! expected path length of an unsuccessful BST search over `ψ` samples.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    #[error("cannot fit a forest on an empty sample set")]
    EmptySamples,
    #[error("sample {index} has {found} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        found: usize,
        expected: usize,
    },
    #[error("model I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("model encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Training parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestParams {
    pub trees: usize,
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// Arena-allocated tree; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(samples: &[&[f64]], height_limit: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let indices: Vec<usize> = (0..samples.len()).collect();
        tree.grow_node(samples, indices, 0, height_limit, rng);
        tree
    }

    fn grow_node(
        &mut self,
        samples: &[&[f64]],
        indices: Vec<usize>,
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> usize {
        let slot = self.nodes.len();
        self.nodes.push(Node::Leaf {
            size: indices.len(),
        });

        if depth >= height_limit || indices.len() <= 1 {
            return slot;
        }

        // Only dimensions that still vary can split this partition.
        let dims = samples[indices[0]].len();
        let candidates: Vec<(usize, f64, f64)> = (0..dims)
            .filter_map(|feature| {
                let (lo, hi) = indices.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &i| {
                    let v = samples[i][feature];
                    (lo.min(v), hi.max(v))
                });
                (hi > lo).then_some((feature, lo, hi))
            })
            .collect();
        if candidates.is_empty() {
            return slot;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| samples[i][feature] < threshold);

        let left = self.grow_node(samples, left_idx, depth + 1, height_limit, rng);
        let right = self.grow_node(samples, right_idx, depth + 1, height_limit, rng);
        self.nodes[slot] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes.get(node) {
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = point.get(*feature).copied().unwrap_or(0.0);
                    node = if value < *threshold { *left } else { *right };
                    depth += 1.0;
                }
                Some(Node::Leaf { size }) => return depth + average_path_length(*size),
                None => return depth,
            }
        }
    }
}

/// Expected path length `c(n)` of an unsuccessful search in a BST of `n` nodes.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        n => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// A trained, read-only isolation forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    dims: usize,
    sample_size: usize,
    trees: Vec<IsolationTree>,
}

impl IsolationForest {
    pub fn fit(samples: &[Vec<f64>], params: ForestParams) -> Result<Self, ForestError> {
        let first = samples.first().ok_or(ForestError::EmptySamples)?;
        let dims = first.len();
        if let Some((index, bad)) = samples.iter().enumerate().find(|(_, s)| s.len() != dims) {
            return Err(ForestError::DimensionMismatch {
                index,
                found: bad.len(),
                expected: dims,
            });
        }

        let sample_size = params.sample_size.clamp(1, samples.len());
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.trees.max(1))
            .map(|_| {
                let picked: Vec<&[f64]> =
                    rand::seq::index::sample(&mut rng, samples.len(), sample_size)
                        .into_iter()
                        .map(|i| samples[i].as_slice())
                        .collect();
                IsolationTree::grow(&picked, height_limit, &mut rng)
            })
            .collect();

        Ok(Self {
            dims,
            sample_size,
            trees,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Mean isolation path length `E[h(x)]` over the ensemble.
    pub fn mean_path_length(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: f64 = self.trees.iter().map(|t| t.path_length(point)).sum();
        total / self.trees.len() as f64
    }

    /// Maps a mean path length to an anomaly score in `(0, 1]`.
    /// Strictly decreasing in `path_length`.
    pub fn score_from_path_length(&self, path_length: f64) -> f64 {
        let normalizer = average_path_length(self.sample_size);
        if normalizer <= 0.0 {
            return 0.5;
        }
        2f64.powf(-path_length / normalizer)
    }

    pub fn score(&self, point: &[f64]) -> f64 {
        self.score_from_path_length(self.mean_path_length(point))
    }

    pub fn to_json(&self) -> Result<String, ForestError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ForestError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ForestError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForestError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
