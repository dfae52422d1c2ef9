//! Quality scores of a fitted partition: GAP statistic and Dunn index

use crate::distance::DistanceMetric;
use crate::kmeans::{KMeans, KMeansModel};
use crate::sampler::{PcaUniformSampler, Sampler, StratifiedSampler, UniformSampler};
use crate::stats::mean_std;
use crate::Result;
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::debug;

/// Seed offset between consecutive GAP reference trials
pub const GAP_TRIAL_PRIME: u64 = 54673;
/// Seed offset between consecutive Dunn subsampling trials
pub const DUNN_TRIAL_PRIME: u64 = 49277;

/// How GAP reference datasets are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceSampling {
    /// Uniform in the per-feature bounding box
    #[default]
    Uniform,
    /// Uniform in the bounding box of the principal components
    Pca,
}

impl ReferenceSampling {
    fn fit(&self, data: ArrayView2<f64>, n_rows: usize) -> Result<Box<dyn Sampler>> {
        Ok(match self {
            ReferenceSampling::Uniform => Box::new(UniformSampler::fit(data, n_rows)),
            ReferenceSampling::Pca => Box::new(PcaUniformSampler::fit(data, n_rows)?),
        })
    }
}

/// GAP value and its standard error
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapScore {
    pub gap: f64,
    pub std: f64,
}

/// Mean over clusters of the mean squared pairwise distance inside the cluster.
///
/// Singleton clusters are skipped; NaN when no cluster has two members.
pub fn dispersion(data: ArrayView2<f64>, labels: ArrayView1<usize>, metric: DistanceMetric) -> f64 {
    let spreads: Vec<f64> = group_rows(labels)
        .into_values()
        .filter(|rows| rows.len() > 1)
        .map(|rows| {
            let cluster = data.select(Axis(0), &rows);
            let distances = metric.condensed(cluster.view());
            distances.iter().map(|d| d * d).sum::<f64>() / distances.len() as f64
        })
        .collect();
    if spreads.is_empty() {
        return f64::NAN;
    }
    spreads.iter().sum::<f64>() / spreads.len() as f64
}

/// Logarithm of a dispersion; clusters of identical rows count as the
/// smallest positive dispersion so the GAP stays finite.
fn log_dispersion(dispersion: f64) -> f64 {
    if dispersion.is_nan() {
        return dispersion;
    }
    dispersion.max(f64::MIN_POSITIVE).ln()
}

fn group_rows(labels: ArrayView1<usize>) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(row);
    }
    groups
}

/// Re-cluster a sample with the same configuration and return its log dispersion
fn refit_log_dispersion(sample: ArrayView2<f64>, kmeans: &KMeans) -> Result<Option<f64>> {
    let model = match kmeans.fit(sample)? {
        Some(model) => model,
        None => return Ok(None),
    };
    let space = kmeans.clustering_space(sample)?;
    Ok(Some(log_dispersion(dispersion(
        space.view(),
        model.labels.view(),
        kmeans.distance,
    ))))
}

fn trial_seeds(seed: u64, n_trials: usize, prime: u64) -> Vec<u64> {
    (0..n_trials as u64)
        .map(|trial| seed.wrapping_add(trial.wrapping_mul(prime)))
        .collect()
}

fn log_dispersions(sampler: &dyn Sampler, kmeans: &KMeans, seeds: &[u64]) -> Result<Vec<f64>> {
    let trials = seeds
        .par_iter()
        .map(|&seed| refit_log_dispersion(sampler.sample(seed).view(), kmeans))
        .collect::<Result<Vec<_>>>()?;
    Ok(trials.into_iter().flatten().collect())
}

/// Exact GAP statistic of `model`, fitted on `data` with configuration `kmeans`.
///
/// # Arguments
/// * `seed` - Root seed of the reference trials
/// * `n_trials` - Number of reference datasets
pub fn gap(
    data: ArrayView2<f64>,
    model: &KMeansModel,
    kmeans: &KMeans,
    seed: u64,
    n_trials: usize,
    reference: ReferenceSampling,
) -> Result<GapScore> {
    let kmeans = kmeans.clone().with_n_clusters(model.n_clusters);
    let space = kmeans.clustering_space(data)?;
    let real = log_dispersion(dispersion(space.view(), model.labels.view(), kmeans.distance));

    let sampler = reference.fit(data, data.nrows())?;
    let references = log_dispersions(
        sampler.as_ref(),
        &kmeans,
        &trial_seeds(seed, n_trials, GAP_TRIAL_PRIME),
    )?;
    let (ref_mean, ref_std) = mean_std(&references);
    let score = GapScore {
        gap: ref_mean - real,
        std: (1.0 + 1.0 / references.len().max(1) as f64).sqrt() * ref_std,
    };
    debug!(k = model.n_clusters, gap = score.gap, std = score.std, "gap");
    Ok(score)
}

/// GAP statistic estimated on stratified subsamples of `sample_size` rows
pub fn sampled_gap(
    data: ArrayView2<f64>,
    model: &KMeansModel,
    kmeans: &KMeans,
    seed: u64,
    n_trials: usize,
    sample_size: usize,
    reference: ReferenceSampling,
) -> Result<GapScore> {
    let kmeans = kmeans.clone().with_n_clusters(model.n_clusters);
    let seeds = trial_seeds(seed, n_trials, GAP_TRIAL_PRIME);

    let reference = reference.fit(data, sample_size)?;
    let references = log_dispersions(reference.as_ref(), &kmeans, &seeds)?;
    let real = StratifiedSampler::new(data, model.labels.view(), sample_size);
    let reals = log_dispersions(&real, &kmeans, &seeds)?;

    let (ref_mean, ref_std) = mean_std(&references);
    let (real_mean, real_std) = mean_std(&reals);
    let score = GapScore {
        gap: ref_mean - real_mean,
        std: (ref_std.powi(2) + real_std.powi(2)).sqrt() / n_trials.max(1) as f64,
    };
    debug!(k = model.n_clusters, gap = score.gap, std = score.std, "sampled gap");
    Ok(score)
}

/// Whether subsampled GAP is cheaper than the exact one
pub fn should_sample_gap(n_rows: usize, sample_size: usize, n_trials: usize) -> bool {
    let (n, s, t) = (n_rows as f64, sample_size as f64, n_trials as f64);
    2.0 * t * s * s < t * n * n
}

/// Whether subsampled Dunn is cheaper than the exact one
pub fn should_sample_dunn(n_rows: usize, sample_size: usize, n_trials: usize) -> bool {
    let (n, s, t) = (n_rows as f64, sample_size as f64, n_trials as f64);
    s * s * t < n * n
}

/// Distance between clusters used by the Dunn index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterClusterDistance {
    /// Smallest non-zero distance between centroids
    #[default]
    Centroid,
    /// Smallest distance between members of different clusters
    Closest,
}

/// Spread of a cluster used by the Dunn index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntraClusterDistance {
    /// Mean distance of members to their centroid
    #[default]
    Average,
    /// Largest distance between two members
    Furthest,
}

fn inter_distance(
    kind: InterClusterDistance,
    model: &KMeansModel,
    data: ArrayView2<f64>,
    labels: ArrayView1<usize>,
) -> f64 {
    match kind {
        InterClusterDistance::Centroid => model
            .distance
            .condensed(model.centroids.view())
            .into_iter()
            .filter(|&d| d != 0.0)
            .fold(f64::INFINITY, f64::min),
        InterClusterDistance::Closest => {
            let groups: Vec<Vec<usize>> = group_rows(labels).into_values().collect();
            let mut closest = f64::INFINITY;
            for (i, first) in groups.iter().enumerate() {
                let first = data.select(Axis(0), first);
                for second in &groups[i + 1..] {
                    let second = data.select(Axis(0), second);
                    for a in first.outer_iter() {
                        for b in second.outer_iter() {
                            closest = closest.min(model.distance.between(a, b));
                        }
                    }
                }
            }
            closest
        }
    }
}

fn intra_distance(
    kind: IntraClusterDistance,
    model: &KMeansModel,
    data: ArrayView2<f64>,
    labels: ArrayView1<usize>,
) -> f64 {
    group_rows(labels)
        .into_iter()
        .map(|(label, rows)| {
            let cluster = data.select(Axis(0), &rows);
            match kind {
                IntraClusterDistance::Average => {
                    let centroid = model.centroids.row(label);
                    cluster
                        .outer_iter()
                        .map(|row| model.distance.between(row, centroid))
                        .sum::<f64>()
                        / rows.len() as f64
                }
                // a singleton has no spread
                IntraClusterDistance::Furthest => model
                    .distance
                    .condensed(cluster.view())
                    .into_iter()
                    .fold(0.0, f64::max),
            }
        })
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Dunn index of `model` on the data it was fitted on; `-inf` for a single cluster.
pub fn dunn(
    data: ArrayView2<f64>,
    model: &KMeansModel,
    inter: InterClusterDistance,
    intra: IntraClusterDistance,
) -> Result<f64> {
    if model.n_clusters == 1 {
        return Ok(f64::NEG_INFINITY);
    }
    let space = if model.normalize_rows {
        crate::kmeans::normalize_rows(data)?
    } else {
        data.to_owned()
    };
    let labels = model.labels.view();
    Ok(inter_distance(inter, model, space.view(), labels)
        / intra_distance(intra, model, space.view(), labels))
}

/// Dunn index estimated on stratified subsamples labelled by `model`
#[allow(clippy::too_many_arguments)]
pub fn sampled_dunn(
    data: ArrayView2<f64>,
    model: &KMeansModel,
    inter: InterClusterDistance,
    intra: IntraClusterDistance,
    seed: u64,
    n_trials: usize,
    sample_size: usize,
) -> Result<f64> {
    if model.n_clusters == 1 {
        return Ok(f64::NEG_INFINITY);
    }
    let sampler = StratifiedSampler::new(data, model.labels.view(), sample_size);
    let distances = trial_seeds(seed, n_trials, DUNN_TRIAL_PRIME)
        .into_par_iter()
        .map(|seed| -> Result<(f64, f64)> {
            let sample = sampler.sample(seed);
            let labels = model.predict(sample.view())?;
            let space = if model.normalize_rows {
                crate::kmeans::normalize_rows(sample.view())?
            } else {
                sample
            };
            Ok((
                inter_distance(inter, model, space.view(), labels.view()),
                intra_distance(intra, model, space.view(), labels.view()),
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    let (inters, intras): (Vec<f64>, Vec<f64>) = distances.into_iter().unzip();
    let (_, inter_std) = mean_std(&inters);
    let (_, intra_std) = mean_std(&intras);
    let min_inter = inters.iter().copied().fold(f64::INFINITY, f64::min);
    let max_intra = intras.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok((min_inter - inter_std) / (max_intra + intra_std))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};

    fn blobs() -> Array2<f64> {
        let mut rows = Vec::new();
        for i in 0..20 {
            let jitter = (i as f64 * 0.7).sin() * 0.2;
            rows.extend_from_slice(&[jitter, (i as f64 * 1.3).cos() * 0.2]);
            rows.extend_from_slice(&[10.0 + jitter, 10.0 + (i as f64 * 0.9).cos() * 0.2]);
        }
        Array2::from_shape_vec((40, 2), rows).unwrap()
    }

    #[test]
    fn test_dispersion_skips_singletons() {
        let data = array![[0.0, 0.0], [0.0, 2.0], [50.0, 50.0]];
        let labels = Array1::from(vec![0, 0, 1]);
        let d = dispersion(data.view(), labels.view(), DistanceMetric::Euclidean);
        assert!((d - 4.0).abs() < 1e-12);

        let singletons = Array1::from(vec![0, 1, 2]);
        assert!(dispersion(data.view(), singletons.view(), DistanceMetric::Euclidean).is_nan());
    }

    #[test]
    fn test_gap_prefers_true_split() {
        let data = blobs();
        let kmeans = KMeans::default();
        let one = kmeans.clone().with_n_clusters(1).fit(data.view()).unwrap().unwrap();
        let two = kmeans.clone().with_n_clusters(2).fit(data.view()).unwrap().unwrap();
        let g1 = gap(data.view(), &one, &kmeans, 0, 10, ReferenceSampling::Uniform).unwrap();
        let g2 = gap(data.view(), &two, &kmeans, 0, 10, ReferenceSampling::Uniform).unwrap();
        assert!(g2.gap > g1.gap + g1.std);
        assert!(g1.std >= 0.0 && g2.std >= 0.0);
    }

    #[test]
    fn test_gap_is_reproducible() {
        let data = blobs();
        let kmeans = KMeans::default();
        let two = kmeans.fit(data.view()).unwrap().unwrap();
        let a = gap(data.view(), &two, &kmeans, 42, 5, ReferenceSampling::Pca).unwrap();
        let b = gap(data.view(), &two, &kmeans, 42, 5, ReferenceSampling::Pca).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sampled_gap_finite() {
        let data = blobs();
        let kmeans = KMeans::default();
        let two = kmeans.fit(data.view()).unwrap().unwrap();
        let score = sampled_gap(data.view(), &two, &kmeans, 3, 4, 20, ReferenceSampling::Uniform).unwrap();
        assert!(score.gap.is_finite());
        assert!(score.gap > 0.0);
    }

    #[test]
    fn test_dunn_single_cluster_is_neg_infinity() {
        let data = blobs();
        let one = KMeans::default().with_n_clusters(1).fit(data.view()).unwrap().unwrap();
        let score = dunn(
            data.view(),
            &one,
            InterClusterDistance::Centroid,
            IntraClusterDistance::Average,
        )
        .unwrap();
        assert_eq!(score, f64::NEG_INFINITY);
    }

    #[test]
    fn test_dunn_well_separated_is_large() {
        let data = blobs();
        let two = KMeans::default().fit(data.view()).unwrap().unwrap();
        for (inter, intra) in [
            (InterClusterDistance::Centroid, IntraClusterDistance::Average),
            (InterClusterDistance::Closest, IntraClusterDistance::Furthest),
        ] {
            let score = dunn(data.view(), &two, inter, intra).unwrap();
            assert!(score > 5.0, "{inter:?}/{intra:?} gave {score}");
        }
        let sampled = sampled_dunn(
            data.view(),
            &two,
            InterClusterDistance::Closest,
            IntraClusterDistance::Furthest,
            0,
            5,
            10,
        )
        .unwrap();
        assert!(sampled > 5.0);
    }

    #[test]
    fn test_dispersion_weighs_far_members() {
        // three tight points plus one far point versus two tight pairs
        let data = array![[0.0, 0.0], [0.0, 1.0], [0.0, 2.0], [0.0, 10.0]];
        let labels = Array1::from(vec![0, 0, 0, 0]);
        let d = dispersion(data.view(), labels.view(), DistanceMetric::Euclidean);
        let expected = (1.0 + 4.0 + 100.0 + 1.0 + 81.0 + 64.0) / 6.0;
        assert!((d - expected).abs() < 1e-12);
    }

    #[test]
    fn test_identical_clusters_have_finite_gap() {
        let mut rows = Vec::new();
        for center in [0.0, 10.0, 20.0] {
            for _ in 0..30 {
                rows.extend_from_slice(&[center, 0.0]);
            }
        }
        let data = Array2::from_shape_vec((90, 2), rows).unwrap();
        let kmeans = KMeans::default().with_n_clusters(3);
        let three = kmeans.fit(data.view()).unwrap().unwrap();
        assert_eq!(dispersion(data.view(), three.labels.view(), DistanceMetric::Euclidean), 0.0);

        let score = gap(data.view(), &three, &kmeans, 0, 5, ReferenceSampling::Uniform).unwrap();
        assert!(score.gap.is_finite());
        assert!(score.std.is_finite());
        assert_eq!(log_dispersion(0.0), f64::MIN_POSITIVE.ln());
        assert!(log_dispersion(f64::NAN).is_nan());
    }

    #[test]
    fn test_dunn_defaults_use_centroids_and_average() {
        assert_eq!(InterClusterDistance::default(), InterClusterDistance::Centroid);
        assert_eq!(IntraClusterDistance::default(), IntraClusterDistance::Average);

        let data = blobs();
        let two = KMeans::default().fit(data.view()).unwrap().unwrap();
        let defaulted = dunn(
            data.view(),
            &two,
            InterClusterDistance::default(),
            IntraClusterDistance::default(),
        )
        .unwrap();
        let explicit = dunn(
            data.view(),
            &two,
            InterClusterDistance::Centroid,
            IntraClusterDistance::Average,
        )
        .unwrap();
        assert_eq!(defaulted, explicit);
    }

    #[test]
    fn test_sampling_thresholds() {
        assert!(should_sample_gap(10_000, 1000, 10));
        assert!(!should_sample_gap(1000, 1000, 10));
        assert!(should_sample_dunn(10_000, 1000, 10));
        assert!(!should_sample_dunn(3000, 1000, 10));
    }
}
