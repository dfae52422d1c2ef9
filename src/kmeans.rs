//! K-means clustering with repair of vanished clusters

use crate::distance::DistanceMetric;
use crate::error::DivisiveError;
use crate::initialization::Initialization;
use crate::validation::validate_n_clusters;
use crate::Result;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use tracing::debug;

/// Number of passes the repair step may take before the fit is declared unfit
pub const REPAIR_RETRIES: usize = 10;

/// K-means configuration
#[derive(Debug, Clone, PartialEq)]
pub struct KMeans {
    /// Number of clusters
    pub n_clusters: usize,
    /// Distance used for assignment
    pub distance: DistanceMetric,
    /// Seed selection strategy
    pub init: Initialization,
    /// Maximum number of Lloyd iterations
    pub max_iter: usize,
    /// Center each row and scale it to unit norm before clustering; `None`
    /// normalizes rows for the correlation distance only
    pub normalize_rows: Option<bool>,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            n_clusters: 2,
            distance: DistanceMetric::Euclidean,
            init: Initialization::Percentile { percentile: 95.0 },
            max_iter: 100,
            normalize_rows: None,
        }
    }
}

impl KMeans {
    #[must_use]
    pub fn with_n_clusters(mut self, n_clusters: usize) -> Self {
        self.n_clusters = n_clusters;
        self
    }

    #[must_use]
    pub fn with_distance(mut self, distance: DistanceMetric) -> Self {
        self.distance = distance;
        self
    }

    #[must_use]
    pub fn with_init(mut self, init: Initialization) -> Self {
        self.init = init;
        self
    }

    #[must_use]
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    #[must_use]
    pub fn with_normalize_rows(mut self, normalize_rows: bool) -> Self {
        self.normalize_rows = Some(normalize_rows);
        self
    }

    /// Whether rows are normalized, resolving the automatic setting from the distance
    pub fn normalizes_rows(&self) -> bool {
        self.normalize_rows
            .unwrap_or(self.distance == DistanceMetric::Correlation)
    }

    /// Fit k-means on `data`.
    ///
    /// # Returns
    /// * `Some(model)` with exactly `n_clusters` distinct labels
    /// * `None` when vanished clusters could not be repaired
    pub fn fit(&self, data: ArrayView2<f64>) -> Result<Option<KMeansModel>> {
        let k = self.n_clusters;
        validate_n_clusters(k, data.nrows(), "k-means")?;
        if k == 1 {
            return self.single(data).map(Some);
        }

        let space = self.clustering_space(data)?;
        let centroids = self.init.initialize(space.view(), k, self.distance)?;
        match lloyd(space.view(), centroids, k, self.distance, self.max_iter) {
            Some((labels, centroids)) => Ok(Some(KMeansModel {
                n_clusters: k,
                labels,
                centroids,
                distance: self.distance,
                normalize_rows: self.normalizes_rows(),
            })),
            None => {
                debug!(k, rows = data.nrows(), "k-means could not keep all clusters populated");
                Ok(None)
            }
        }
    }

    /// Single-cluster model of `data` with the centroid in the clustering space
    pub fn single(&self, data: ArrayView2<f64>) -> Result<KMeansModel> {
        let space = self.clustering_space(data)?;
        Ok(KMeansModel::single(
            space.view(),
            self.distance,
            self.normalizes_rows(),
        ))
    }

    /// The data as the algorithm sees it, row-normalized when configured.
    pub fn clustering_space(&self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        if self.normalizes_rows() {
            normalize_rows(data)
        } else {
            Ok(data.to_owned())
        }
    }
}

/// Fitted k-means partition
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansModel {
    /// Number of clusters
    pub n_clusters: usize,
    /// Cluster assignments for training data
    pub labels: Array1<usize>,
    /// Cluster centroids, in the normalized space when `normalize_rows` is set
    pub centroids: Array2<f64>,
    pub distance: DistanceMetric,
    pub normalize_rows: bool,
}

impl KMeansModel {
    /// Single-cluster model: all labels zero, centroid = column-wise mean of
    /// `data`, which must already be in the clustering space.
    pub fn single(data: ArrayView2<f64>, distance: DistanceMetric, normalize_rows: bool) -> Self {
        let centroid = data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(data.ncols()));
        Self {
            n_clusters: 1,
            labels: Array1::zeros(data.nrows()),
            centroids: centroid.insert_axis(Axis(0)),
            distance,
            normalize_rows,
        }
    }

    /// Assign every row to its nearest centroid
    pub fn predict(&self, data: ArrayView2<f64>) -> Result<Array1<usize>> {
        self.check_columns(data)?;
        if self.n_clusters == 1 {
            return Ok(Array1::zeros(data.nrows()));
        }
        let space = if self.normalize_rows {
            normalize_rows(data)?
        } else {
            data.to_owned()
        };
        Ok(assign(space.view(), self.centroids.view(), self.distance))
    }

    /// Distances from every row to every centroid
    pub fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_columns(data)?;
        let space = if self.normalize_rows {
            normalize_rows(data)?
        } else {
            data.to_owned()
        };
        self.distance.cdist(space.view(), self.centroids.view())
    }

    /// Get cluster sizes
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in self.labels.iter() {
            if label < self.n_clusters {
                sizes[label] += 1;
            }
        }
        sizes
    }

    /// Sum of distances between the training rows and their centroids
    pub fn inertia(&self, data: ArrayView2<f64>) -> Result<f64> {
        if data.nrows() != self.labels.len() {
            return Err(DivisiveError::Shape(format!(
                "model was fit on {} rows, got {}",
                self.labels.len(),
                data.nrows()
            )));
        }
        let distances = self.transform(data)?;
        Ok(self
            .labels
            .iter()
            .enumerate()
            .map(|(row, &label)| distances[[row, label]])
            .sum())
    }

    fn check_columns(&self, data: ArrayView2<f64>) -> Result<()> {
        if data.ncols() != self.centroids.ncols() {
            return Err(DivisiveError::Shape(format!(
                "model has {} features, got {}",
                self.centroids.ncols(),
                data.ncols()
            )));
        }
        Ok(())
    }
}

/// Subtract each row's mean and scale it to unit norm.
///
/// Fails with [`DivisiveError::ConstantRows`] when a row has zero variance.
pub fn normalize_rows(data: ArrayView2<f64>) -> Result<Array2<f64>> {
    let mut normalized = data.to_owned();
    let mut constant = Vec::new();
    for (idx, mut row) in normalized.outer_iter_mut().enumerate() {
        if is_constant(row.view()) {
            constant.push(idx);
            continue;
        }
        let mean = row.mean().unwrap_or_default();
        row.mapv_inplace(|v| v - mean);
        let norm = row.dot(&row).sqrt();
        row.mapv_inplace(|v| v / norm);
    }
    if constant.is_empty() {
        Ok(normalized)
    } else {
        Err(DivisiveError::ConstantRows { rows: constant })
    }
}

/// Indices of rows whose values are all equal
pub fn constant_rows(data: ArrayView2<f64>) -> Vec<usize> {
    data.outer_iter()
        .enumerate()
        .filter(|(_, row)| is_constant(row.view()))
        .map(|(idx, _)| idx)
        .collect()
}

fn is_constant(row: ArrayView1<f64>) -> bool {
    match row.first() {
        Some(&first) => row.iter().all(|&v| v == first),
        None => true,
    }
}

fn assign(data: ArrayView2<f64>, centroids: ArrayView2<f64>, metric: DistanceMetric) -> Array1<usize> {
    let labels: Vec<usize> = (0..data.nrows())
        .into_par_iter()
        .map(|row| metric.nearest(data.row(row), centroids).0)
        .collect();
    Array1::from(labels)
}

fn means(data: ArrayView2<f64>, labels: &Array1<usize>, k: usize) -> Array2<f64> {
    let mut sums = Array2::<f64>::zeros((k, data.ncols()));
    let mut counts = vec![0usize; k];
    for (row, &label) in data.outer_iter().zip(labels.iter()) {
        let mut sum = sums.row_mut(label);
        sum += &row;
        counts[label] += 1;
    }
    for (mut sum, &count) in sums.outer_iter_mut().zip(&counts) {
        if count > 0 {
            sum /= count as f64;
        }
    }
    sums
}

fn present_labels(labels: &Array1<usize>, k: usize) -> Vec<bool> {
    let mut present = vec![false; k];
    for &label in labels.iter() {
        present[label] = true;
    }
    present
}

fn lloyd(
    data: ArrayView2<f64>,
    mut centroids: Array2<f64>,
    k: usize,
    metric: DistanceMetric,
    max_iter: usize,
) -> Option<(Array1<usize>, Array2<f64>)> {
    let mut labels = assign(data, centroids.view(), metric);
    let mut previous: Option<Array1<usize>> = None;
    for _ in 0..max_iter {
        repair(data, &mut labels, &mut centroids, k, metric)?;
        if previous.as_ref() == Some(&labels) {
            break;
        }
        centroids = means(data, &labels, k);
        let next = assign(data, centroids.view(), metric);
        previous = Some(std::mem::replace(&mut labels, next));
    }
    repair(data, &mut labels, &mut centroids, k, metric)?;
    let centroids = means(data, &labels, k);
    Some((labels, centroids))
}

/// Move the observations furthest from the populated centroids into the
/// missing clusters until all `k` labels are present.
fn repair(
    data: ArrayView2<f64>,
    labels: &mut Array1<usize>,
    centroids: &mut Array2<f64>,
    k: usize,
    metric: DistanceMetric,
) -> Option<()> {
    for _ in 0..REPAIR_RETRIES {
        let present = present_labels(labels, k);
        let mut known: Vec<usize> = (0..k).filter(|&label| present[label]).collect();
        if known.len() == k {
            return Some(());
        }
        for missing in (0..k).filter(|&label| !present[label]) {
            let furthest = {
                let centroids = centroids.view();
                let known = &known;
                let closest: Vec<f64> = (0..data.nrows())
                    .into_par_iter()
                    .map(|row| {
                        known
                            .iter()
                            .map(|&label| metric.between(data.row(row), centroids.row(label)))
                            .fold(f64::INFINITY, f64::min)
                    })
                    .collect();
                argmax(&closest)
            };
            labels[furthest] = missing;
            centroids.row_mut(missing).assign(&data.row(furthest));
            known.push(missing);
        }
    }
    present_labels(labels, k).into_iter().all(|p| p).then_some(())
}

/// Index of the first maximum
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (idx, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = idx;
        }
    }
    best
}
