use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A dense, ordered (row, column) table of f64, NaN marking missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<C> {
    pub rows: Vec<String>,
    pub columns: Vec<C>,
    /// row major
    values: Vec<f64>,
}

/// Sample variance (ddof = 1) over the non-NaN values.
/// Fewer than two values gives NaN.
pub fn nan_variance(values: impl Iterator<Item = f64>) -> f64 {
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let observed: Vec<f64> = values.filter(|v| !v.is_nan()).collect();
    for v in observed.iter() {
        n += 1;
        sum += v;
    }
    if n < 2 {
        return f64::NAN;
    }
    let mean = sum / n as f64;
    for v in observed.iter() {
        sum_sq += (v - mean) * (v - mean);
    }
    sum_sq / (n - 1) as f64
}

impl<C: Clone + Send + Sync> Frame<C> {
    pub fn from_rows(rows: Vec<String>, columns: Vec<C>, values: Vec<Vec<f64>>) -> Frame<C> {
        assert_eq!(rows.len(), values.len(), "one value vector per row");
        let width = columns.len();
        let mut flat = Vec::with_capacity(rows.len() * width);
        for row in values {
            assert_eq!(row.len(), width, "row length must match column count");
            flat.extend(row);
        }
        Frame {
            rows,
            columns,
            values: flat,
        }
    }

    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.values[row * self.columns.len() + column]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        let width = self.columns.len();
        &self.values[row * width..(row + 1) * width]
    }

    pub fn column(&self, column: usize) -> impl Iterator<Item = f64> + '_ {
        (0..self.rows.len()).map(move |row| self.get(row, column))
    }

    /// number of rows with a non-NaN value in this column
    pub fn observations(&self, column: usize) -> usize {
        self.column(column).filter(|v| !v.is_nan()).count()
    }

    pub fn variance(&self, column: usize) -> f64 {
        nan_variance(self.column(column))
    }

    /// Columns that survive the pruning thresholds, in order.
    /// A column needs at least `min_measurements` non-NaN values,
    /// and (if min_variance > 0) a variance of at least `min_variance`.
    pub fn kept_columns(&self, min_measurements: usize, min_variance: f64) -> Vec<usize> {
        (0..self.columns.len())
            .into_par_iter()
            .filter(|&col| {
                if min_measurements > 0 && self.observations(col) < min_measurements {
                    return false;
                }
                if min_variance > 0.0 {
                    // NaN variance fails the comparison, and is dropped
                    return self.variance(col) >= min_variance;
                }
                true
            })
            .collect()
    }

    /// A new frame without the columns failing the thresholds.
    pub fn prune(&self, min_measurements: usize, min_variance: f64) -> Frame<C> {
        let keep = self.kept_columns(min_measurements, min_variance);
        self.select_columns(&keep)
    }

    pub fn select_columns(&self, keep: &[usize]) -> Frame<C> {
        let values = (0..self.rows.len())
            .map(|row| keep.iter().map(|&col| self.get(row, col)).collect())
            .collect();
        Frame::from_rows(
            self.rows.clone(),
            keep.iter().map(|&col| self.columns[col].clone()).collect(),
            values,
        )
    }

    /// Pairwise distance between rows: the mean absolute difference over
    /// the columns both rows have a value for. Pairs sharing fewer than
    /// `min_shared` columns get NaN.
    pub fn distance_matrix(&self, min_shared: usize) -> Frame<String> {
        let min_shared = min_shared.max(1);
        let n = self.rows.len();
        let values: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|a| {
                let row_a = self.row(a);
                (0..n)
                    .map(|b| {
                        let row_b = self.row(b);
                        let mut shared = 0usize;
                        let mut total = 0.0;
                        for (x, y) in row_a.iter().zip(row_b.iter()) {
                            if !x.is_nan() && !y.is_nan() {
                                shared += 1;
                                total += (x - y).abs();
                            }
                        }
                        if shared < min_shared {
                            f64::NAN
                        } else {
                            total / shared as f64
                        }
                    })
                    .collect()
            })
            .collect();
        Frame::from_rows(self.rows.clone(), self.rows.clone(), values)
    }
}
