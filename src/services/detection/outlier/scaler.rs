//! Mean/stdev feature standardization, persisted alongside each model.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(data: &Array2<f64>) -> Self {
        let mean = data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(data.ncols()));
        let n = data.nrows().max(1) as f64;
        let mut std = vec![0.0; data.ncols()];
        for (j, s) in std.iter_mut().enumerate() {
            let m = mean[j];
            let var = data
                .column(j)
                .iter()
                .map(|x| (x - m).powi(2))
                .sum::<f64>()
                / n;
            // constant columns scale to 1 so they standardize to 0
            *s = var.sqrt().max(1e-9);
        }
        Self { mean: mean.to_vec(), std }
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(j, x)| {
                let mean = self.mean.get(j).copied().unwrap_or(0.0);
                let std = self.std.get(j).copied().unwrap_or(1.0);
                (x - mean) / std
            })
            .collect()
    }

    pub fn transform(&self, data: &Array2<f64>) -> Array2<f64> {
        let mut out = data.clone();
        for mut row in out.rows_mut() {
            let scaled = self.transform_row(row.as_slice().unwrap_or(&[]));
            for (j, v) in scaled.into_iter().enumerate() {
                row[j] = v;
            }
        }
        out
    }
}
