//! Reproducible samplers for reference and subsampled data
//!
//! Every sampler is a pure function of its fitted state and a seed, so
//! parallel trials can run in any order and still agree.

use crate::error::DivisiveError;
use crate::Result;
use linfa_linalg::eigh::Eigh;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// Draw a sample of observations
pub trait Sampler: Sync {
    fn sample(&self, seed: u64) -> Array2<f64>;
}

/// Uniform sampling inside the per-feature bounding box of the data
#[derive(Debug, Clone)]
pub struct UniformSampler {
    n_rows: usize,
    mins: Array1<f64>,
    maxs: Array1<f64>,
}

impl UniformSampler {
    pub fn fit(data: ArrayView2<f64>, n_rows: usize) -> Self {
        let mins = data.fold_axis(Axis(0), f64::INFINITY, |acc, &v| acc.min(v));
        let maxs = data.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, &v| acc.max(v));
        Self { n_rows, mins, maxs }
    }
}

impl Sampler for UniformSampler {
    fn sample(&self, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((self.n_rows, self.mins.len()), |(_, j)| {
            let (low, high) = (self.mins[j], self.maxs[j]);
            if high > low {
                rng.gen_range(low..high)
            } else {
                low
            }
        })
    }
}

/// Uniform sampling in the bounding box of the principal components, rotated
/// back into feature space.
#[derive(Debug, Clone)]
pub struct PcaUniformSampler {
    mean: Array1<f64>,
    components: Array2<f64>,
    inner: UniformSampler,
}

impl PcaUniformSampler {
    pub fn fit(data: ArrayView2<f64>, n_rows: usize) -> Result<Self> {
        let mean = data
            .mean_axis(Axis(0))
            .ok_or(DivisiveError::EmptyDataset)?;
        let centered = &data - &mean;
        let dof = data.nrows().saturating_sub(1).max(1) as f64;
        let covariance = centered.t().dot(&centered) / dof;
        let (_, components) = covariance
            .eigh()
            .map_err(|err| DivisiveError::Decomposition(err.to_string()))?;
        let projected = centered.dot(&components);
        Ok(Self {
            mean,
            components,
            inner: UniformSampler::fit(projected.view(), n_rows),
        })
    }
}

impl Sampler for PcaUniformSampler {
    fn sample(&self, seed: u64) -> Array2<f64> {
        self.inner.sample(seed).dot(&self.components.t()) + &self.mean
    }
}

/// Subsamples of real observations preserving the label proportions
#[derive(Debug, Clone)]
pub struct StratifiedSampler<'a> {
    data: ArrayView2<'a, f64>,
    groups: Vec<Vec<usize>>,
    quotas: Vec<usize>,
}

impl<'a> StratifiedSampler<'a> {
    pub fn new(data: ArrayView2<'a, f64>, labels: ArrayView1<'_, usize>, n_rows: usize) -> Self {
        let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (row, &label) in labels.iter().enumerate() {
            by_label.entry(label).or_default().push(row);
        }
        let groups: Vec<Vec<usize>> = by_label.into_values().collect();
        let quotas = quotas(&groups, n_rows.min(labels.len()), labels.len());
        Self {
            data,
            groups,
            quotas,
        }
    }
}

// Largest remainder apportionment, ties to the lower label.
fn quotas(groups: &[Vec<usize>], n_rows: usize, total: usize) -> Vec<usize> {
    if total == 0 {
        return vec![0; groups.len()];
    }
    let exact: Vec<f64> = groups
        .iter()
        .map(|g| n_rows as f64 * g.len() as f64 / total as f64)
        .collect();
    let mut quotas: Vec<usize> = exact.iter().map(|q| q.floor() as usize).collect();
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    let mut missing = n_rows.saturating_sub(quotas.iter().sum());
    for idx in order {
        if missing == 0 {
            break;
        }
        if quotas[idx] < groups[idx].len() {
            quotas[idx] += 1;
            missing -= 1;
        }
    }
    quotas
}

impl Sampler for StratifiedSampler<'_> {
    fn sample(&self, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut rows = Vec::with_capacity(self.quotas.iter().sum());
        for (group, &quota) in self.groups.iter().zip(&self.quotas) {
            let mut members = group.clone();
            members.shuffle(&mut rng);
            rows.extend_from_slice(&members[..quota]);
        }
        self.data.select(Axis(0), &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn test_uniform_within_bounds() {
        let data = array![[0.0, 10.0], [1.0, 20.0], [0.5, 15.0]];
        let sampler = UniformSampler::fit(data.view(), 50);
        let sample = sampler.sample(7);
        assert_eq!(sample.shape(), &[50, 2]);
        for row in sample.outer_iter() {
            assert!((0.0..=1.0).contains(&row[0]));
            assert!((10.0..=20.0).contains(&row[1]));
        }
    }

    #[test]
    fn test_same_seed_same_sample() {
        let data = array![[0.0, 10.0], [1.0, 20.0], [0.5, 15.0]];
        let sampler = UniformSampler::fit(data.view(), 20);
        assert_eq!(sampler.sample(3), sampler.sample(3));
        assert_ne!(sampler.sample(3), sampler.sample(4));
    }

    #[test]
    fn test_pca_sampler_shape() {
        let data = array![[0.0, 0.0], [1.0, 1.1], [2.0, 1.9], [3.0, 3.2], [4.0, 3.9]];
        let sampler = PcaUniformSampler::fit(data.view(), 30).unwrap();
        let sample = sampler.sample(11);
        assert_eq!(sample.shape(), &[30, 2]);
        assert!(sample.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_stratified_keeps_proportions() {
        let data = Array2::from_shape_fn((100, 1), |(i, _)| i as f64);
        let labels = Array1::from_shape_fn(100, |i| if i < 75 { 0 } else { 1 });
        let sampler = StratifiedSampler::new(data.view(), labels.view(), 20);
        let sample = sampler.sample(5);
        assert_eq!(sample.nrows(), 20);
        let from_first = sample.iter().filter(|&&v| v < 75.0).count();
        assert_eq!(from_first, 15);
    }

    #[test]
    fn test_quotas_sum_to_request() {
        let groups = vec![vec![0; 3], vec![0; 3], vec![0; 3]];
        let quotas = quotas(&groups, 5, 9);
        assert_eq!(quotas.iter().sum::<usize>(), 5);
        assert_eq!(quotas, vec![2, 2, 1]);
    }

    #[test]
    fn test_stratified_outlives_labels() {
        let data = Array2::from_shape_fn((12, 2), |(i, j)| (i * 2 + j) as f64);
        let sampler = {
            let labels = Array1::from_shape_fn(12, |i| i % 3);
            StratifiedSampler::new(data.view(), labels.view(), 6)
        };
        let sample = sampler.sample(1);
        assert_eq!(sample.shape(), &[6, 2]);
        let residues: Vec<usize> = sample.column(1).iter().map(|&v| ((v as usize - 1) / 2) % 3).collect();
        for label in 0..3 {
            assert_eq!(residues.iter().filter(|&&r| r == label).count(), 2);
        }
    }
}
