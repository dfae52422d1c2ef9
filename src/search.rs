//! Automatic choice of the number of clusters

use crate::kmeans::{KMeans, KMeansModel};
use crate::score::{
    dunn, gap, sampled_dunn, sampled_gap, should_sample_dunn, should_sample_gap, GapScore,
    InterClusterDistance, IntraClusterDistance, ReferenceSampling,
};
use crate::validation::validate_k_range;
use crate::Result;
use ndarray::ArrayView2;
use rayon::prelude::*;
use tracing::debug;

/// Seed offset between consecutive candidate cluster counts
pub const CANDIDATE_PRIME: u64 = 32801;

/// Score recorded for one candidate number of clusters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    pub n_clusters: usize,
    pub score: f64,
    /// Standard error, reported by the GAP search only
    pub std: Option<f64>,
}

/// Outcome of a search; `best` is `None` when no number of clusters qualified
#[derive(Debug, Clone)]
pub struct Selection {
    pub best: Option<KMeansModel>,
    pub scores: Vec<CandidateScore>,
}

impl Selection {
    pub fn n_clusters(&self) -> Option<usize> {
        self.best.as_ref().map(|model| model.n_clusters)
    }
}

fn candidate_seed(seed: u64, k: usize) -> u64 {
    seed.wrapping_add(CANDIDATE_PRIME.wrapping_mul(k as u64))
}

/// GAP statistic search: the smallest k with GAP(k) >= GAP(k+1) - s(k+1)
///
/// Candidates are fit in increasing order and the search stops at the first
/// k whose GAP is within one standard error of the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct GapSearch {
    pub kmeans: KMeans,
    pub min_clusters: usize,
    pub max_clusters: usize,
    /// Number of reference datasets per candidate
    pub n_trials: usize,
    /// Rows per subsample when the subsampled estimate is cheaper
    pub sample_size: usize,
    pub seed: u64,
    pub reference: ReferenceSampling,
}

impl Default for GapSearch {
    fn default() -> Self {
        Self {
            kmeans: KMeans::default(),
            min_clusters: 1,
            max_clusters: 10,
            n_trials: 10,
            sample_size: 1000,
            seed: 0,
            reference: ReferenceSampling::Uniform,
        }
    }
}

impl GapSearch {
    /// Two-candidate search answering "is there any structure at all"
    pub fn fast(kmeans: KMeans) -> Self {
        Self {
            kmeans,
            min_clusters: 1,
            max_clusters: 2,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_kmeans(mut self, kmeans: KMeans) -> Self {
        self.kmeans = kmeans;
        self
    }

    #[must_use]
    pub fn with_range(mut self, min_clusters: usize, max_clusters: usize) -> Self {
        self.min_clusters = min_clusters;
        self.max_clusters = max_clusters;
        self
    }

    #[must_use]
    pub fn with_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = n_trials;
        self
    }

    #[must_use]
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_reference(mut self, reference: ReferenceSampling) -> Self {
        self.reference = reference;
        self
    }

    pub fn select(&self, data: ArrayView2<f64>) -> Result<Selection> {
        validate_k_range(self.min_clusters, self.max_clusters, "gap search")?;
        let upper = self.max_clusters.min(data.nrows());
        let sampled = should_sample_gap(data.nrows(), self.sample_size, self.n_trials);
        let mut scores = Vec::new();
        let mut previous: Option<(KMeansModel, GapScore)> = None;

        for k in self.min_clusters..=upper {
            let kmeans = self.kmeans.clone().with_n_clusters(k);
            let Some(model) = kmeans.fit(data)? else {
                debug!(k, "dropping candidate, k-means could not be fit");
                continue;
            };
            let seed = candidate_seed(self.seed, k);
            let score = if sampled {
                sampled_gap(
                    data,
                    &model,
                    &kmeans,
                    seed,
                    self.n_trials,
                    self.sample_size,
                    self.reference,
                )?
            } else {
                gap(data, &model, &kmeans, seed, self.n_trials, self.reference)?
            };
            scores.push(CandidateScore {
                n_clusters: k,
                score: score.gap,
                std: Some(score.std),
            });
            if let Some((best, best_score)) = previous.take() {
                if best_score.gap >= score.gap - score.std {
                    debug!(k = best.n_clusters, "gap search settled");
                    return Ok(Selection {
                        best: Some(best),
                        scores,
                    });
                }
            }
            previous = Some((model, score));
        }
        debug!(
            max_clusters = self.max_clusters,
            "gap kept increasing beyond one standard error, no number of clusters qualified"
        );
        Ok(Selection { best: None, scores })
    }
}

/// Dunn index search: evaluate every k in range and keep the best scoring one
#[derive(Debug, Clone, PartialEq)]
pub struct DunnSearch {
    pub kmeans: KMeans,
    pub min_clusters: usize,
    pub max_clusters: usize,
    pub inter: InterClusterDistance,
    pub intra: IntraClusterDistance,
    pub sample_size: usize,
    pub n_trials: usize,
    pub seed: u64,
}

impl Default for DunnSearch {
    fn default() -> Self {
        Self {
            kmeans: KMeans::default(),
            min_clusters: 2,
            max_clusters: 10,
            inter: InterClusterDistance::default(),
            intra: IntraClusterDistance::default(),
            sample_size: 1000,
            n_trials: 10,
            seed: 0,
        }
    }
}

impl DunnSearch {
    #[must_use]
    pub fn with_kmeans(mut self, kmeans: KMeans) -> Self {
        self.kmeans = kmeans;
        self
    }

    #[must_use]
    pub fn with_range(mut self, min_clusters: usize, max_clusters: usize) -> Self {
        self.min_clusters = min_clusters;
        self.max_clusters = max_clusters;
        self
    }

    #[must_use]
    pub fn with_distances(mut self, inter: InterClusterDistance, intra: IntraClusterDistance) -> Self {
        self.inter = inter;
        self.intra = intra;
        self
    }

    #[must_use]
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    #[must_use]
    pub fn with_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = n_trials;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn select(&self, data: ArrayView2<f64>) -> Result<Selection> {
        validate_k_range(self.min_clusters, self.max_clusters, "dunn search")?;
        let upper = self.max_clusters.min(data.nrows());
        let sampled = should_sample_dunn(data.nrows(), self.sample_size, self.n_trials);
        let candidates: Vec<usize> = (self.min_clusters..=upper).collect();

        let fitted = candidates
            .into_par_iter()
            .map(|k| -> Result<Option<(KMeansModel, f64)>> {
                let Some(model) = self.kmeans.clone().with_n_clusters(k).fit(data)? else {
                    debug!(k, "dropping candidate, k-means could not be fit");
                    return Ok(None);
                };
                let score = if sampled {
                    sampled_dunn(
                        data,
                        &model,
                        self.inter,
                        self.intra,
                        candidate_seed(self.seed, k),
                        self.n_trials,
                        self.sample_size,
                    )?
                } else {
                    dunn(data, &model, self.inter, self.intra)?
                };
                debug!(k, score, "dunn");
                Ok(Some((model, score)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut scores = Vec::new();
        let mut best: Option<(KMeansModel, f64)> = None;
        for (model, score) in fitted.into_iter().flatten() {
            scores.push(CandidateScore {
                n_clusters: model.n_clusters,
                score,
                std: None,
            });
            // a single cluster scores -inf and NaN never wins
            if model.n_clusters < 2 || score.is_nan() || score == f64::NEG_INFINITY {
                continue;
            }
            if best.as_ref().map_or(true, |(_, top)| score > *top) {
                best = Some((model, score));
            }
        }
        Ok(Selection {
            best: best.map(|(model, _)| model),
            scores,
        })
    }
}

/// Strategy used to choose the number of clusters at a node
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCountSelector {
    Gap(GapSearch),
    Dunn(DunnSearch),
}

impl ClusterCountSelector {
    pub fn select(&self, data: ArrayView2<f64>) -> Result<Selection> {
        match self {
            ClusterCountSelector::Gap(search) => search.select(data),
            ClusterCountSelector::Dunn(search) => search.select(data),
        }
    }

    pub fn max_clusters(&self) -> usize {
        match self {
            ClusterCountSelector::Gap(search) => search.max_clusters,
            ClusterCountSelector::Dunn(search) => search.max_clusters,
        }
    }

    pub fn kmeans(&self) -> &KMeans {
        match self {
            ClusterCountSelector::Gap(search) => &search.kmeans,
            ClusterCountSelector::Dunn(search) => &search.kmeans,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, ClusterCountSelector::Gap(_))
    }
}

impl Default for ClusterCountSelector {
    fn default() -> Self {
        ClusterCountSelector::Gap(GapSearch::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn line_of_blobs(centers: &[f64], per_blob: usize) -> Array2<f64> {
        let mut rows = Vec::new();
        for &center in centers {
            for i in 0..per_blob {
                let phase = i as f64;
                rows.push(center + (phase * 0.77).sin() * 0.5);
                rows.push((phase * 1.31).cos() * 0.5);
            }
        }
        Array2::from_shape_vec((centers.len() * per_blob, 2), rows).unwrap()
    }

    #[test]
    fn test_gap_finds_three_blobs() {
        let data = line_of_blobs(&[0.0, 15.0, 45.0], 30);
        let selection = GapSearch::default().with_range(1, 6).select(data.view()).unwrap();
        assert_eq!(selection.n_clusters(), Some(3));
        assert!(selection.scores.len() >= 4);
        assert!(selection.scores.iter().all(|s| s.std.is_some()));
    }

    #[test]
    fn test_gap_without_peak_is_unfit() {
        let data = line_of_blobs(&[0.0, 15.0, 45.0], 30);
        let selection = GapSearch::default().with_range(1, 2).select(data.view()).unwrap();
        assert!(selection.best.is_none());
        assert_eq!(selection.scores.len(), 2);
    }

    #[test]
    fn test_gap_settles_on_identical_groups() {
        let mut rows = Vec::new();
        for center in [0.0, 10.0, 20.0] {
            for _ in 0..50 {
                rows.extend_from_slice(&[center, 0.0]);
            }
        }
        let data = Array2::from_shape_vec((150, 2), rows).unwrap();
        let selection = GapSearch::default().with_range(1, 6).select(data.view()).unwrap();
        assert_eq!(selection.n_clusters(), Some(3));
        assert!(selection.scores.iter().all(|s| s.score.is_finite()));
    }

    #[test]
    fn test_gap_single_point_cloud_is_one_cluster() {
        let data = Array2::from_elem((40, 3), 2.5);
        let selection = GapSearch::default().with_range(1, 4).select(data.view()).unwrap();
        assert_eq!(selection.n_clusters(), Some(1));
    }

    #[test]
    fn test_dunn_never_picks_one() {
        let data = line_of_blobs(&[0.0, 20.0], 25);
        let selection = DunnSearch::default()
            .with_range(1, 4)
            .select(data.view())
            .unwrap();
        assert_eq!(selection.n_clusters(), Some(2));
        let one = selection.scores.iter().find(|s| s.n_clusters == 1).unwrap();
        assert_eq!(one.score, f64::NEG_INFINITY);
    }

    #[test]
    fn test_invalid_range() {
        let data = line_of_blobs(&[0.0], 10);
        assert!(GapSearch::default().with_range(3, 2).select(data.view()).is_err());
        assert!(DunnSearch::default().with_range(0, 2).select(data.view()).is_err());
    }

    #[test]
    fn test_selector_dispatch() {
        let selector = ClusterCountSelector::Dunn(DunnSearch::default().with_range(2, 5));
        assert_eq!(selector.max_clusters(), 5);
        assert!(!selector.is_gap());
        assert!(ClusterCountSelector::default().is_gap());
    }
}
