//! Isolation forest over standardized feature vectors.
//!
//! Anomalies isolate in fewer random splits than inliers; the score is the
//! classic `2^(-E[h(x)] / c(n))` normalization, in (0, 1], higher = more
//! anomalous. The decision threshold is calibrated on the training set so
//! that `contamination` of it is flagged.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const DEFAULT_TREES: usize = 100;
const MAX_SUBSAMPLE: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    /// Fit a forest on `data` (rows = samples). Deterministic for a given
    /// seed so refits on identical history produce identical models.
    pub fn fit(data: &Array2<f64>, seed: u64) -> Self {
        let n = data.nrows();
        if n == 0 {
            return Self { trees: Vec::new(), sample_size: 0 };
        }
        let sample_size = n.min(MAX_SUBSAMPLE).max(2);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut trees = Vec::with_capacity(DEFAULT_TREES);
        for _ in 0..DEFAULT_TREES {
            let mut indices: Vec<usize> =
                (0..sample_size).map(|_| rng.gen_range(0..n)).collect();
            indices.sort_unstable();
            trees.push(build_tree(data, &indices, 0, max_depth, &mut rng));
        }

        Self { trees, sample_size }
    }

    /// Anomaly score for one (already standardized) row.
    pub fn score(&self, row: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, row, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.0;
        }
        2f64.powf(-mean_path / c)
    }

    /// Score threshold flagging `contamination` of the training data.
    pub fn calibrate_threshold(&self, data: &Array2<f64>, contamination: f64) -> f64 {
        let mut scores: Vec<f64> = data
            .rows()
            .into_iter()
            .map(|row| self.score(row.as_slice().unwrap_or(&[])))
            .collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((scores.len() as f64) * (1.0 - contamination)).floor() as usize;
        scores
            .get(idx.min(scores.len().saturating_sub(1)))
            .copied()
            .unwrap_or(0.5)
    }
}

fn build_tree(
    data: &Array2<f64>,
    indices: &[usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> Node {
    if indices.len() <= 1 || depth >= max_depth {
        return Node::Leaf { size: indices.len().max(1) };
    }

    // pick a feature that still varies inside this partition
    let n_features = data.ncols();
    let mut candidate = None;
    let start = rng.gen_range(0..n_features);
    for offset in 0..n_features {
        let feature = (start + offset) % n_features;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &i in indices {
            let v = data[[i, feature]];
            min = min.min(v);
            max = max.max(v);
        }
        if max > min {
            candidate = Some((feature, min, max));
            break;
        }
    }
    let Some((feature, min, max)) = candidate else {
        return Node::Leaf { size: indices.len() };
    };

    let threshold = rng.gen_range(min..max);
    let (left, right): (Vec<usize>, Vec<usize>) =
        indices.iter().partition(|&&i| data[[i, feature]] < threshold);
    if left.is_empty() || right.is_empty() {
        return Node::Leaf { size: indices.len() };
    }

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(data, &left, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(data, &right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, row: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split { feature, threshold, left, right } => {
            let value = row.get(*feature).copied().unwrap_or(0.0);
            if value < *threshold {
                path_length(left, row, depth + 1)
            } else {
                path_length(right, row, depth + 1)
            }
        },
    }
}

/// Average path length of an unsuccessful BST search over `n` nodes.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn clustered_data() -> Array2<f64> {
        // tight cluster around the origin
        let mut rows = Vec::new();
        for i in 0..200 {
            let x = (i % 10) as f64 * 0.01;
            let y = (i % 7) as f64 * 0.01;
            rows.push([x, y]);
        }
        Array2::from_shape_vec(
            (rows.len(), 2),
            rows.into_iter().flatten().collect(),
        )
        .unwrap()
    }

    #[test]
    fn outliers_score_higher_than_inliers() {
        let data = clustered_data();
        let forest = IsolationForest::fit(&data, 42);

        let inlier = forest.score(&[0.05, 0.03]);
        let outlier = forest.score(&[30.0, -25.0]);
        assert!(
            outlier > inlier,
            "outlier {outlier} should exceed inlier {inlier}"
        );
        assert!(outlier > 0.6);
    }

    #[test]
    fn scores_are_bounded() {
        let data = clustered_data();
        let forest = IsolationForest::fit(&data, 1);
        for row in [[0.0, 0.0], [100.0, 100.0], [-5.0, 3.0]] {
            let s = forest.score(&row);
            assert!(s > 0.0 && s <= 1.0, "score out of range: {s}");
        }
    }

    #[test]
    fn fit_is_deterministic_for_a_seed() {
        let data = clustered_data();
        let a = IsolationForest::fit(&data, 7);
        let b = IsolationForest::fit(&data, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn threshold_flags_roughly_the_contaminated_share() {
        let data = clustered_data();
        let forest = IsolationForest::fit(&data, 42);
        let threshold = forest.calibrate_threshold(&data, 0.05);
        let flagged = data
            .rows()
            .into_iter()
            .filter(|row| forest.score(row.as_slice().unwrap()) > threshold)
            .count();
        // 5% of 200 = 10, allow slack for ties
        assert!(flagged <= 20, "flagged {flagged} of 200");
    }

    #[test]
    fn serde_round_trip() {
        let data = clustered_data();
        let forest = IsolationForest::fit(&data, 3);
        let json = serde_json::to_string(&forest).unwrap();
        let back: IsolationForest = serde_json::from_str(&json).unwrap();
        assert_eq!(forest, back);
        assert_eq!(forest.score(&[1.0, 1.0]), back.score(&[1.0, 1.0]));
    }

    #[test]
    fn constant_data_degenerates_gracefully() {
        let data = Array2::from_elem((50, 3), 1.0);
        let forest = IsolationForest::fit(&data, 9);
        let s = forest.score(&[1.0, 1.0, 1.0]);
        assert!(s.is_finite());
    }
}
