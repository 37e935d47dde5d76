//! Supervised override: a logistic classifier fitted on operator feedback.
//!
//! Feedback labels are scarce (tens of rows), so a compact gradient-descent
//! logistic model is the right size; the probability output is used directly
//! as the anomaly score with a 0.5 decision threshold.

use super::scaler::StandardScaler;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

const EPOCHS: usize = 300;
const LEARNING_RATE: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub scaler: StandardScaler,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticModel {
    /// Fit on rows `x` with binary labels `y`. Returns `None` when the data
    /// cannot support a classifier (empty, or a single class).
    pub fn fit(x: &Array2<f64>, y: &[bool]) -> Option<Self> {
        if x.nrows() == 0 || x.nrows() != y.len() {
            return None;
        }
        if y.iter().all(|l| *l) || y.iter().all(|l| !*l) {
            return None;
        }

        let scaler = StandardScaler::fit(x);
        let scaled = scaler.transform(x);
        let n = scaled.nrows() as f64;
        let dims = scaled.ncols();

        let mut weights = vec![0.0; dims];
        let mut bias = 0.0;

        for _ in 0..EPOCHS {
            let mut grad_w = vec![0.0; dims];
            let mut grad_b = 0.0;
            for (i, row) in scaled.rows().into_iter().enumerate() {
                let z = bias
                    + row
                        .iter()
                        .zip(&weights)
                        .map(|(x, w)| x * w)
                        .sum::<f64>();
                let error = sigmoid(z) - if y[i] { 1.0 } else { 0.0 };
                for (j, x) in row.iter().enumerate() {
                    grad_w[j] += error * x;
                }
                grad_b += error;
            }
            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= LEARNING_RATE * g / n;
            }
            bias -= LEARNING_RATE * grad_b / n;
        }

        Some(Self { scaler, weights, bias })
    }

    /// P(anomaly) for one raw (unscaled) feature row.
    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        let scaled = self.scaler.transform_row(row);
        let z = self.bias
            + scaled
                .iter()
                .zip(&self.weights)
                .map(|(x, w)| x * w)
                .sum::<f64>();
        sigmoid(z)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn separable() -> (Array2<f64>, Vec<bool>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..20 {
            rows.push([i as f64 * 0.1, 1.0]);
            labels.push(false);
            rows.push([10.0 + i as f64 * 0.1, 8.0]);
            labels.push(true);
        }
        let x = Array2::from_shape_vec(
            (rows.len(), 2),
            rows.into_iter().flatten().collect(),
        )
        .unwrap();
        (x, labels)
    }

    #[test]
    fn learns_a_separable_boundary() {
        let (x, y) = separable();
        let model = LogisticModel::fit(&x, &y).unwrap();
        assert!(model.predict_proba(&[0.5, 1.0]) < 0.5);
        assert!(model.predict_proba(&[11.0, 8.0]) > 0.5);
    }

    #[test]
    fn refuses_single_class_data() {
        let x = Array2::from_elem((10, 2), 1.0);
        assert!(LogisticModel::fit(&x, &vec![true; 10]).is_none());
        assert!(LogisticModel::fit(&x, &vec![false; 10]).is_none());
    }

    #[test]
    fn refuses_mismatched_shapes() {
        let x = Array2::from_elem((3, 2), 1.0);
        assert!(LogisticModel::fit(&x, &[true, false]).is_none());
    }

    #[test]
    fn probabilities_stay_in_unit_interval() {
        let (x, y) = separable();
        let model = LogisticModel::fit(&x, &y).unwrap();
        for row in [[-100.0, -100.0], [100.0, 100.0], [0.0, 0.0]] {
            let p = model.predict_proba(&row);
            assert!((0.0..=1.0).contains(&p));
        }
    }
}
