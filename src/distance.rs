//! Pairwise distances between observations

use crate::error::DivisiveError;
use crate::Result;
use linfa_nn::distance::{Distance, L1Dist, L2Dist, LInfDist};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;

/// Distance metrics supported by the clustering stages, named after scipy's `cdist`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    /// Euclidean distance (L2 norm)
    #[default]
    Euclidean,
    /// Squared Euclidean distance
    SqEuclidean,
    /// Manhattan distance (L1 norm)
    Cityblock,
    /// Maximum coordinate difference (L-infinity norm)
    Chebyshev,
    /// 1 - cosine similarity
    Cosine,
    /// 1 - Pearson correlation of the two vectors
    Correlation,
}

impl DistanceMetric {
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::SqEuclidean => "sqeuclidean",
            DistanceMetric::Cityblock => "cityblock",
            DistanceMetric::Chebyshev => "chebyshev",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Correlation => "correlation",
        }
    }

    /// Distance between two observations
    pub fn between(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match self {
            DistanceMetric::Euclidean => L2Dist.distance(a, b),
            DistanceMetric::SqEuclidean => L2Dist.rdistance(a, b),
            DistanceMetric::Cityblock => L1Dist.distance(a, b),
            DistanceMetric::Chebyshev => LInfDist.distance(a, b),
            DistanceMetric::Cosine => {
                let dot = a.dot(&b);
                let norms = a.dot(&a).sqrt() * b.dot(&b).sqrt();
                angular(dot, norms, a, b)
            }
            DistanceMetric::Correlation => {
                let ca = &a - a.mean().unwrap_or_default();
                let cb = &b - b.mean().unwrap_or_default();
                let dot = ca.dot(&cb);
                let norms = ca.dot(&ca).sqrt() * cb.dot(&cb).sqrt();
                angular(dot, norms, a, b)
            }
        }
    }

    /// Distance matrix of shape `(|a|, |b|)`.
    ///
    /// When both arguments view the same buffer the symmetric path is taken,
    /// so the result is exactly symmetric with a zero diagonal.
    pub fn cdist(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>> {
        if a.ncols() != b.ncols() {
            return Err(DivisiveError::Shape(format!(
                "cdist requires equal column counts, got {} and {}",
                a.ncols(),
                b.ncols()
            )));
        }
        if same_buffer(&a, &b) {
            return Ok(self.pdist(a));
        }
        let n_b = b.nrows();
        let rows: Vec<f64> = (0..a.nrows())
            .into_par_iter()
            .flat_map_iter(|i| {
                let row = a.row(i);
                b.outer_iter()
                    .map(move |other| self.between(row, other))
                    .collect::<Vec<_>>()
            })
            .collect();
        Array2::from_shape_vec((a.nrows(), n_b), rows)
            .map_err(|err| DivisiveError::Shape(err.to_string()))
    }

    /// Symmetric distance matrix of a single set of observations.
    pub fn pdist(&self, a: ArrayView2<f64>) -> Array2<f64> {
        let n = a.nrows();
        let upper = self.condensed(a);
        let mut result = Array2::zeros((n, n));
        let mut pos = 0;
        for i in 0..n {
            for j in (i + 1)..n {
                result[[i, j]] = upper[pos];
                result[[j, i]] = upper[pos];
                pos += 1;
            }
        }
        result
    }

    /// Upper triangle of the distance matrix, row by row.
    pub fn condensed(&self, a: ArrayView2<f64>) -> Vec<f64> {
        let n = a.nrows();
        (0..n)
            .into_par_iter()
            .flat_map_iter(|i| {
                let row = a.row(i);
                ((i + 1)..n)
                    .map(move |j| self.between(row, a.row(j)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Index of and distance to the closest centroid; ties resolve to the lowest index.
    pub fn nearest(&self, row: ArrayView1<f64>, centroids: ArrayView2<f64>) -> (usize, f64) {
        let mut best = (0, f64::INFINITY);
        for (idx, centroid) in centroids.outer_iter().enumerate() {
            let d = self.between(row, centroid);
            if d < best.1 {
                best = (idx, d);
            }
        }
        best
    }
}

// Zero-norm vectors have no direction; identical ones are at distance 0.
fn angular(dot: f64, norms: f64, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if norms > 0.0 {
        (1.0 - dot / norms).max(0.0)
    } else if a == b {
        0.0
    } else {
        1.0
    }
}

fn same_buffer(a: &ArrayView2<f64>, b: &ArrayView2<f64>) -> bool {
    a.as_ptr() == b.as_ptr() && a.shape() == b.shape() && a.strides() == b.strides()
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistanceMetric {
    type Err = DivisiveError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "sqeuclidean" => Ok(DistanceMetric::SqEuclidean),
            "cityblock" | "manhattan" => Ok(DistanceMetric::Cityblock),
            "chebyshev" => Ok(DistanceMetric::Chebyshev),
            "cosine" => Ok(DistanceMetric::Cosine),
            "correlation" => Ok(DistanceMetric::Correlation),
            _ => Err(DivisiveError::UnknownDistance(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_basic_metrics() {
        let a = array![0.0, 0.0];
        let b = array![3.0, 4.0];
        assert!((DistanceMetric::Euclidean.between(a.view(), b.view()) - 5.0).abs() < 1e-12);
        assert!((DistanceMetric::SqEuclidean.between(a.view(), b.view()) - 25.0).abs() < 1e-12);
        assert!((DistanceMetric::Cityblock.between(a.view(), b.view()) - 7.0).abs() < 1e-12);
        assert!((DistanceMetric::Chebyshev.between(a.view(), b.view()) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_correlation_ignores_offset_and_scale() {
        let a = array![1.0, 2.0, 3.0];
        let b = array![10.0, 20.0, 30.0];
        let c = array![3.0, 2.0, 1.0];
        assert!(DistanceMetric::Correlation.between(a.view(), b.view()).abs() < 1e-12);
        assert!((DistanceMetric::Correlation.between(a.view(), c.view()) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_self_distance_symmetric() {
        let a = array![[0.0, 1.0], [2.0, 0.5], [4.0, 4.0], [-1.0, 3.0]];
        for metric in [DistanceMetric::Euclidean, DistanceMetric::Correlation, DistanceMetric::Cosine] {
            let d = metric.cdist(a.view(), a.view()).unwrap();
            assert_eq!(d.shape(), &[4, 4]);
            for i in 0..4 {
                assert_eq!(d[[i, i]], 0.0);
                for j in 0..4 {
                    assert_eq!(d[[i, j]], d[[j, i]]);
                }
            }
        }
    }

    #[test]
    fn test_self_distance_matches_general_path() {
        let a = array![[0.0, 1.0], [2.0, 0.5], [4.0, 4.0]];
        let copy = a.clone();
        let fast = DistanceMetric::Euclidean.cdist(a.view(), a.view()).unwrap();
        let general = DistanceMetric::Euclidean.cdist(a.view(), copy.view()).unwrap();
        for (x, y) in fast.iter().zip(general.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_shape_and_mismatch() {
        let a = array![[0.0, 1.0], [2.0, 0.5], [4.0, 4.0]];
        let b = array![[1.0, 1.0], [0.0, 0.0]];
        let d = DistanceMetric::Cityblock.cdist(a.view(), b.view()).unwrap();
        assert_eq!(d.shape(), &[3, 2]);
        assert_eq!(d[[0, 1]], 1.0);

        let c = array![[1.0, 1.0, 1.0]];
        assert!(matches!(
            DistanceMetric::Euclidean.cdist(a.view(), c.view()),
            Err(DivisiveError::Shape(_))
        ));
    }

    #[test]
    fn test_parse() {
        assert_eq!("Correlation".parse::<DistanceMetric>().unwrap(), DistanceMetric::Correlation);
        assert_eq!("manhattan".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cityblock);
        assert!(matches!(
            "hamming".parse::<DistanceMetric>(),
            Err(DivisiveError::UnknownDistance(_))
        ));
    }

    #[test]
    fn test_nearest_prefers_first_on_ties() {
        let centroids = array![[1.0, 0.0], [-1.0, 0.0]];
        let (idx, dist) = DistanceMetric::Euclidean.nearest(array![0.0, 0.0].view(), centroids.view());
        assert_eq!(idx, 0);
        assert!((dist - 1.0).abs() < 1e-12);
    }
}
