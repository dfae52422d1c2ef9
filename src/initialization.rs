//! Seed selection for k-means
//!
//! All strategies start from the observation that deviates the most (or sits
//! at a given percentile of deviation) from a linear fit of the first feature
//! on the remaining ones, then add seeds greedily, each one far from the seeds
//! chosen so far.

use crate::distance::DistanceMetric;
use crate::validation::{validate_n_clusters, validate_percentile};
use crate::Result;
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use tracing::debug;

/// Size of the boxes the KD-tree initialization collapses observations into
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeafSize {
    /// Fixed number of observations per box
    Absolute(usize),
    /// Fraction of the number of observations
    Fraction(f64),
}

impl LeafSize {
    fn resolve(&self, n_rows: usize) -> usize {
        match *self {
            LeafSize::Absolute(size) => size.max(1),
            LeafSize::Fraction(rate) => ((rate * n_rows as f64).round() as usize).max(1),
        }
    }
}

/// Strategy used to pick the initial centroids
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initialization {
    /// Always take the most extreme candidate
    Extreme,
    /// Take the candidate at the given percentile of the score
    Percentile { percentile: f64 },
    /// Percentile selection over KD-tree box centroids weighted by box population
    KdTree { leaf_size: LeafSize, percentile: f64 },
}

impl Default for Initialization {
    fn default() -> Self {
        Initialization::Percentile { percentile: 99.0 }
    }
}

impl Initialization {
    /// Pick `k` initial centroids from `data`.
    ///
    /// # Arguments
    /// * `data` - Observations in rows
    /// * `k` - Number of centroids, `1 <= k <= data.nrows()`
    /// * `metric` - Distance used by the greedy maximin step
    ///
    /// # Returns
    /// * Centroid table with `k` rows
    pub fn initialize(
        &self,
        data: ArrayView2<f64>,
        k: usize,
        metric: DistanceMetric,
    ) -> Result<Array2<f64>> {
        validate_n_clusters(k, data.nrows(), "initialization")?;
        match *self {
            Initialization::Extreme => {
                let weights = vec![1.0; data.nrows()];
                Ok(select_seeds(data, &weights, k, metric, 100.0))
            }
            Initialization::Percentile { percentile } => {
                validate_percentile(percentile, "percentile initialization")?;
                let weights = vec![1.0; data.nrows()];
                Ok(select_seeds(data, &weights, k, metric, percentile))
            }
            Initialization::KdTree {
                leaf_size,
                percentile,
            } => {
                validate_percentile(percentile, "kd-tree initialization")?;
                let leaf_size = leaf_size.resolve(data.nrows());
                let (boxes, weights) = kd_boxes(data, leaf_size);
                if boxes.nrows() < k {
                    debug!(
                        boxes = boxes.nrows(),
                        k, "too few kd-tree boxes, seeding from raw observations"
                    );
                    let weights = vec![1.0; data.nrows()];
                    return Ok(select_seeds(data, &weights, k, metric, percentile));
                }
                Ok(select_seeds(boxes.view(), &weights, k, metric, percentile))
            }
        }
    }
}

fn select_seeds(
    points: ArrayView2<f64>,
    weights: &[f64],
    k: usize,
    metric: DistanceMetric,
    percentile: f64,
) -> Array2<f64> {
    let residuals = residuals(points).to_vec();
    let first = percentile_index(&residuals, weights, percentile);
    let mut chosen = vec![first];
    let mut closest: Vec<f64> = points
        .outer_iter()
        .map(|row| metric.between(row, points.row(first)))
        .collect();
    while chosen.len() < k {
        let next = percentile_index(&closest, weights, percentile);
        chosen.push(next);
        let seed = points.row(next);
        for (dist, row) in closest.iter_mut().zip(points.outer_iter()) {
            *dist = dist.min(metric.between(row, seed));
        }
    }
    points.select(Axis(0), &chosen)
}

/// Absolute residuals of a linear fit of the first feature on the others.
///
/// Falls back to the absolute deviation from the mean when there is nothing
/// to regress on or the fit is degenerate.
fn residuals(data: ArrayView2<f64>) -> Array1<f64> {
    let target = data.column(0).to_owned();
    // constant regressors make the design matrix rank deficient
    let varying: Vec<usize> = (1..data.ncols())
        .filter(|&j| {
            let column = data.column(j);
            column.iter().any(|&v| v != column[0])
        })
        .collect();
    if !varying.is_empty() && data.nrows() > varying.len() + 1 {
        let features = data.select(Axis(1), &varying);
        let dataset = Dataset::new(features.clone(), target.clone());
        match LinearRegression::new().fit(&dataset) {
            Ok(model) => {
                let predicted: Array1<f64> = model.predict(&features);
                let residuals = (&predicted - &target).mapv(f64::abs);
                if residuals.iter().all(|v| v.is_finite()) {
                    return residuals;
                }
            }
            Err(err) => debug!(%err, "linear fit failed, using deviation from mean"),
        }
    }
    let mean = target.mean().unwrap_or_default();
    target.mapv(|v| (v - mean).abs())
}

/// Index of the value at `percentile` (nearest rank) of a weighted sample.
///
/// Among equal values the lowest index wins.
fn percentile_index(values: &[f64], weights: &[f64], percentile: f64) -> usize {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let total: f64 = weights.iter().sum();
    let target = (percentile / 100.0 * (total - 1.0)).round();
    let mut cumulative = 0.0;
    let mut chosen = order[order.len() - 1];
    for &idx in &order {
        cumulative += weights[idx];
        if cumulative > target {
            chosen = idx;
            break;
        }
    }
    let value = values[chosen];
    values.iter().position(|&v| v == value).unwrap_or(chosen)
}

/// Collapse observations into KD-tree leaf boxes, returning box means and populations.
fn kd_boxes(data: ArrayView2<f64>, leaf_size: usize) -> (Array2<f64>, Vec<f64>) {
    let mut leaves = Vec::new();
    split_box((0..data.nrows()).collect(), 0, data, leaf_size, &mut leaves);
    let mut centroids = Array2::zeros((leaves.len(), data.ncols()));
    let mut weights = Vec::with_capacity(leaves.len());
    for (mut centroid, members) in centroids.outer_iter_mut().zip(&leaves) {
        let subset = data.select(Axis(0), members);
        if let Some(mean) = subset.mean_axis(Axis(0)) {
            centroid.assign(&mean);
        }
        weights.push(members.len() as f64);
    }
    (centroids, weights)
}

fn split_box(
    mut members: Vec<usize>,
    depth: usize,
    data: ArrayView2<f64>,
    leaf_size: usize,
    leaves: &mut Vec<Vec<usize>>,
) {
    if members.len() < 2 * leaf_size {
        leaves.push(members);
        return;
    }
    let feature = depth % data.ncols();
    members.sort_by(|&a, &b| data[[a, feature]].total_cmp(&data[[b, feature]]));
    let upper = members.split_off(members.len() / 2);
    split_box(members, depth + 1, data, leaf_size, leaves);
    split_box(upper, depth + 1, data, leaf_size, leaves);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn line_with_outlier() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [1.0, 1.0],
            [2.0, 2.0],
            [3.0, 3.0],
            [4.0, 4.0],
            [10.0, 2.0],
        ]
    }

    #[test]
    fn test_percentile_index_nearest_rank() {
        let values = [5.0, 1.0, 3.0, 2.0, 4.0];
        let weights = [1.0; 5];
        assert_eq!(percentile_index(&values, &weights, 100.0), 0);
        assert_eq!(percentile_index(&values, &weights, 0.0), 1);
        assert_eq!(percentile_index(&values, &weights, 50.0), 2);
    }

    #[test]
    fn test_weighted_percentile() {
        let values = [1.0, 2.0, 3.0];
        // the middle value owns most of the mass
        let weights = [1.0, 8.0, 1.0];
        assert_eq!(percentile_index(&values, &weights, 85.0), 1);
        assert_eq!(percentile_index(&values, &weights, 100.0), 2);
    }

    #[test]
    fn test_extreme_picks_outlier_first() {
        let data = line_with_outlier();
        let seeds = Initialization::Extreme
            .initialize(data.view(), 2, DistanceMetric::Euclidean)
            .unwrap();
        assert_eq!(seeds.row(0), data.row(5));
        // furthest from the outlier
        assert_eq!(seeds.row(1), data.row(0));
    }

    #[test]
    fn test_percentile_100_matches_extreme() {
        let data = line_with_outlier();
        let extreme = Initialization::Extreme
            .initialize(data.view(), 3, DistanceMetric::Euclidean)
            .unwrap();
        let percentile = Initialization::Percentile { percentile: 100.0 }
            .initialize(data.view(), 3, DistanceMetric::Euclidean)
            .unwrap();
        assert_eq!(extreme, percentile);
    }

    #[test]
    fn test_single_feature_uses_mean_deviation() {
        let data = array![[0.0], [1.0], [2.0], [9.0]];
        let seeds = Initialization::Extreme
            .initialize(data.view(), 1, DistanceMetric::Euclidean)
            .unwrap();
        assert_eq!(seeds, array![[9.0]]);
    }

    #[test]
    fn test_invalid_k() {
        let data = line_with_outlier();
        let init = Initialization::default();
        assert!(init.initialize(data.view(), 0, DistanceMetric::Euclidean).is_err());
        assert!(init.initialize(data.view(), 7, DistanceMetric::Euclidean).is_err());
        let bad = Initialization::Percentile { percentile: 120.0 };
        assert!(bad.initialize(data.view(), 2, DistanceMetric::Euclidean).is_err());
    }

    #[test]
    fn test_kd_boxes_cover_all_rows() {
        let data = Array2::from_shape_fn((40, 2), |(i, j)| (i * (j + 1)) as f64);
        let (boxes, weights) = kd_boxes(data.view(), 5);
        assert_eq!(boxes.ncols(), 2);
        assert_eq!(weights.iter().sum::<f64>(), 40.0);
        assert!(weights.iter().all(|&w| (5.0..10.0).contains(&w)));

        let seeds = Initialization::KdTree {
            leaf_size: LeafSize::Absolute(5),
            percentile: 99.0,
        }
        .initialize(data.view(), 3, DistanceMetric::Euclidean)
        .unwrap();
        assert_eq!(seeds.shape(), &[3, 2]);
    }
}
