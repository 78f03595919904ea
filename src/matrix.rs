//! Count matrices.
//!
//! Workers fill a [`PartialCounts`] for their partition, the dispatcher
//! folds those into one [`CountMatrix`] with [`CountMatrix::update`].
//! Merging is per-cell addition, so the order partial results arrive in
//! does not matter. Row keys (samples) and column keys (bins, genes,
//! motifs) are discovered as we go and only get a fixed order when a
//! [`Frame`] is requested.
pub mod frame;

use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::ops::AddAssign;

pub use frame::Frame;

/// A per-cell value that can be merged by addition.
pub trait Tally: Default + Clone + Send + Sync + AddAssign + std::fmt::Debug + 'static {
    type Field: Copy + std::fmt::Debug + Send + Sync;
    /// The field used for variance and distance calculations.
    const PRIMARY: Self::Field;

    fn field(&self, field: Self::Field) -> f64;
    /// Does this cell carry at least one observation?
    fn is_observed(&self) -> bool;
    /// number of classified units this value represents
    fn units(&self) -> u64;
}

pub trait ColumnKey: Ord + Clone + Hash + Eq + Send + Sync + std::fmt::Debug + 'static {}
impl<T: Ord + Clone + Hash + Eq + Send + Sync + std::fmt::Debug + 'static> ColumnKey for T {}

/// Run statistics: how many records were filtered for which reason etc.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats(BTreeMap<String, u64>);

impl Stats {
    pub fn add(&mut self, key: &str, count: u64) {
        *self.0.entry(key.to_string()).or_insert(0) += count;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &Stats) {
        for (key, count) in other.0.iter() {
            self.add(key, *count);
        }
    }

    /// sorted by key
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// The result of counting one partition.
#[derive(Debug, Clone)]
pub struct PartialCounts<C: ColumnKey, V: Tally> {
    /// which partition this came from, for progress reporting
    pub partition: String,
    pub timed_out: bool,
    pub stats: Stats,
    counts: HashMap<String, HashMap<C, V>>,
}

impl<C: ColumnKey, V: Tally> PartialCounts<C, V> {
    pub fn new(partition: impl Into<String>) -> Self {
        PartialCounts {
            partition: partition.into(),
            timed_out: false,
            stats: Stats::default(),
            counts: HashMap::new(),
        }
    }

    pub fn add(&mut self, row: &str, column: C, value: V) {
        // avoid allocating the row key for every call
        if let Some(per_row) = self.counts.get_mut(row) {
            *per_row.entry(column).or_default() += value;
            return;
        }
        self.counts
            .entry(row.to_string())
            .or_default()
            .insert(column, value);
    }

    pub fn get(&self, row: &str, column: &C) -> Option<&V> {
        self.counts.get(row).and_then(|per_row| per_row.get(column))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.values().all(|x| x.is_empty())
    }

    pub fn units(&self) -> u64 {
        self.counts
            .values()
            .flat_map(|per_row| per_row.values())
            .map(|v| v.units())
            .sum()
    }
}

/// Summary of one column over all rows.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRow<C, V> {
    pub column: C,
    /// sum over all rows
    pub total: V,
    /// variance of the primary field across rows
    pub variance: f64,
    /// number of rows with an observation
    pub n_samples: usize,
}

pub struct CountMatrix<C: ColumnKey, V: Tally> {
    counts: HashMap<String, HashMap<C, V>>,
    columns: HashSet<C>,
    stats: Stats,
    partitions_merged: usize,
    partitions_timed_out: usize,
}

impl<C: ColumnKey, V: Tally> Default for CountMatrix<C, V> {
    fn default() -> Self {
        CountMatrix {
            counts: HashMap::new(),
            columns: HashSet::new(),
            stats: Stats::default(),
            partitions_merged: 0,
            partitions_timed_out: 0,
        }
    }
}

impl<C: ColumnKey, V: Tally> CountMatrix<C, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partial result. Unknown keys start at zero.
    pub fn update(&mut self, partial: PartialCounts<C, V>) {
        let PartialCounts {
            counts,
            stats,
            timed_out,
            ..
        } = partial;
        for (row, per_row) in counts {
            let target = self.counts.entry(row).or_default();
            for (column, value) in per_row {
                if !self.columns.contains(&column) {
                    self.columns.insert(column.clone());
                }
                *target.entry(column).or_default() += value;
            }
        }
        self.stats.merge(&stats);
        self.partitions_merged += 1;
        if timed_out {
            self.partitions_timed_out += 1;
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn partitions_merged(&self) -> usize {
        self.partitions_merged
    }

    pub fn partitions_timed_out(&self) -> usize {
        self.partitions_timed_out
    }

    /// row keys, sorted
    pub fn rows(&self) -> Vec<String> {
        let mut rows: Vec<String> = self.counts.keys().cloned().collect();
        rows.sort();
        rows
    }

    /// column keys, sorted
    pub fn columns(&self) -> Vec<C> {
        let mut columns: Vec<C> = self.columns.iter().cloned().collect();
        columns.sort();
        columns
    }

    /// the value of one cell, zero if never seen
    pub fn get(&self, row: &str, column: &C) -> V {
        self.counts
            .get(row)
            .and_then(|per_row| per_row.get(column))
            .cloned()
            .unwrap_or_default()
    }

    pub fn units(&self) -> u64 {
        self.counts
            .values()
            .flat_map(|per_row| per_row.values())
            .map(|v| v.units())
            .sum()
    }

    /// Every non-empty cell as (row index, column index, value),
    /// indices referring to rows() / columns().
    pub fn triplets(&self) -> (Vec<String>, Vec<C>, Vec<(usize, usize, V)>) {
        let rows = self.rows();
        let columns = self.columns();
        let column_index: HashMap<&C, usize> =
            columns.iter().enumerate().map(|(ii, c)| (c, ii)).collect();
        let mut triplets = Vec::new();
        for (row_idx, row) in rows.iter().enumerate() {
            for (column, value) in self.counts[row].iter() {
                triplets.push((row_idx, column_index[column], value.clone()));
            }
        }
        triplets.sort_by_key(|(r, c, _)| (*c, *r));
        (rows, columns, triplets)
    }

    /// Dense rows x columns view of one field.
    pub fn get_frame(&self, field: V::Field) -> Frame<C> {
        let rows = self.rows();
        let columns = self.columns();
        let empty = V::default().field(field);
        let values: Vec<Vec<f64>> = rows
            .par_iter()
            .map(|row| {
                let per_row = &self.counts[row];
                columns
                    .iter()
                    .map(|column| per_row.get(column).map_or(empty, |v| v.field(field)))
                    .collect()
            })
            .collect();
        Frame::from_rows(rows, columns, values)
    }

    /// One entry per column, aggregated over all rows.
    pub fn get_bulk_frame(&self) -> Vec<BulkRow<C, V>> {
        let rows = self.rows();
        let columns = self.columns();
        let empty = V::default().field(V::PRIMARY);
        columns
            .into_par_iter()
            .map(|column| {
                let mut total = V::default();
                let mut n_samples = 0;
                let mut values = Vec::with_capacity(rows.len());
                for row in rows.iter() {
                    match self.counts[row].get(&column) {
                        Some(v) => {
                            total += v.clone();
                            if v.is_observed() {
                                n_samples += 1;
                            }
                            values.push(v.field(V::PRIMARY));
                        }
                        None => values.push(empty),
                    }
                }
                BulkRow {
                    column,
                    total,
                    variance: frame::nan_variance(values.into_iter()),
                    n_samples,
                }
            })
            .collect()
    }

    /// Pairwise row distances over the primary field.
    pub fn get_sample_distance_matrix(&self, min_shared: usize) -> Frame<String> {
        self.get_frame(V::PRIMARY).distance_matrix(min_shared)
    }

    /// Drop the columns failing the thresholds (see [`Frame::prune`])
    /// from the matrix itself.
    pub fn prune(&mut self, min_measurements: usize, min_variance: f64) {
        let frame = self.get_frame(V::PRIMARY);
        let keep: HashSet<C> = frame
            .kept_columns(min_measurements, min_variance)
            .into_iter()
            .map(|col| frame.columns[col].clone())
            .collect();
        for per_row in self.counts.values_mut() {
            per_row.retain(|column, _| keep.contains(column));
        }
        self.columns.retain(|column| keep.contains(column));
    }
}
