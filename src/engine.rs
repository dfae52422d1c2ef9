//! Recursive top-down splitting of a dataset into a cluster tree

use crate::error::DivisiveError;
use crate::feature_selection::{FeatureFilter, FeatureSelector};
use crate::kmeans::{constant_rows, KMeans};
use crate::search::{ClusterCountSelector, GapSearch};
use crate::tree::{ClusterNode, StopReason};
use crate::validation::{validate_dataset, validate_rate};
use crate::Result;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::ThreadPool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives the number of observations finalized in every leaf
pub trait ProgressSink: Sync {
    fn consumed(&self, n_observations: usize);
}

impl<F> ProgressSink for F
where
    F: Fn(usize) + Sync,
{
    fn consumed(&self, n_observations: usize) {
        self(n_observations)
    }
}

/// Size at or under which a branch is not split
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MinimalSize {
    /// Fixed number of observations
    Absolute(usize),
    /// Fraction of the whole dataset
    Fraction(f64),
}

impl Default for MinimalSize {
    fn default() -> Self {
        MinimalSize::Fraction(0.001)
    }
}

impl MinimalSize {
    /// Number of observations for a dataset of `n_rows`
    pub fn resolve(&self, n_rows: usize) -> Result<usize> {
        match *self {
            MinimalSize::Absolute(size) => Ok(size),
            MinimalSize::Fraction(rate) => {
                validate_rate(rate, "minimal_size", "divisive engine")?;
                Ok((rate * n_rows as f64) as usize)
            }
        }
    }
}

impl FromStr for MinimalSize {
    type Err = DivisiveError;

    /// Whole numbers are counts, values strictly between 0 and 1 are fractions
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(size) = s.parse::<usize>() {
            return Ok(MinimalSize::Absolute(size));
        }
        match s.parse::<f64>() {
            Ok(rate) if rate > 0.0 && rate < 1.0 => Ok(MinimalSize::Fraction(rate)),
            _ => Err(DivisiveError::InvalidArgument {
                arg: "minimal_size",
                reason: format!("expected a count or a fraction in (0, 1), got `{s}`"),
            }),
        }
    }
}

/// Configuration of a divisive build
#[derive(Debug, Clone, PartialEq)]
pub struct DivisiveConfig {
    /// Search deciding the number of clusters of every split
    pub kmeans: ClusterCountSelector,
    /// Cheap `k in {1, 2}` check run before the full search
    pub fast_kmeans: Option<GapSearch>,
    pub feature_filter: FeatureFilter,
    /// Branches of at most this many observations are not split
    pub minimal_size: MinimalSize,
    /// Splits producing a cluster of at most this many observations are rejected
    pub rejection_size: usize,
    /// Rejection size as a fraction of the whole dataset, combined by maximum
    pub rejection_percentage: Option<f64>,
}

impl Default for DivisiveConfig {
    fn default() -> Self {
        Self {
            kmeans: ClusterCountSelector::default(),
            fast_kmeans: None,
            feature_filter: FeatureFilter::None,
            minimal_size: MinimalSize::default(),
            rejection_size: 0,
            rejection_percentage: None,
        }
    }
}

impl DivisiveConfig {
    #[must_use]
    pub fn with_selector(mut self, kmeans: ClusterCountSelector) -> Self {
        self.kmeans = kmeans;
        self
    }

    #[must_use]
    pub fn with_fast_kmeans(mut self, fast_kmeans: Option<GapSearch>) -> Self {
        self.fast_kmeans = fast_kmeans;
        self
    }

    #[must_use]
    pub fn with_feature_filter(mut self, feature_filter: FeatureFilter) -> Self {
        self.feature_filter = feature_filter;
        self
    }

    #[must_use]
    pub fn with_minimal_size(mut self, minimal_size: usize) -> Self {
        self.minimal_size = MinimalSize::Absolute(minimal_size);
        self
    }

    /// Minimal branch size as a fraction of the whole dataset
    #[must_use]
    pub fn with_minimal_rate(mut self, rate: f64) -> Self {
        self.minimal_size = MinimalSize::Fraction(rate);
        self
    }

    #[must_use]
    pub fn with_rejection_size(mut self, rejection_size: usize) -> Self {
        self.rejection_size = rejection_size;
        self
    }

    #[must_use]
    pub fn with_rejection_percentage(mut self, rejection_percentage: Option<f64>) -> Self {
        self.rejection_percentage = rejection_percentage;
        self
    }

    /// Rejection size in effect for a dataset of `n_rows` observations
    pub fn effective_rejection_size(&self, n_rows: usize) -> Result<usize> {
        let Some(rate) = self.rejection_percentage else {
            return Ok(self.rejection_size);
        };
        validate_rate(rate, "rejection_percentage", "divisive engine")?;
        Ok(self.rejection_size.max((rate * n_rows as f64) as usize))
    }
}

/// Builds a [`ClusterNode`] tree from a dataset
pub struct DivisiveEngine<'a> {
    config: DivisiveConfig,
    progress: Option<&'a dyn ProgressSink>,
    pool: Option<Arc<ThreadPool>>,
}

impl<'a> DivisiveEngine<'a> {
    pub fn new(config: DivisiveConfig) -> Self {
        Self {
            config,
            progress: None,
            pool: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run every parallel step of the build inside `pool`
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &DivisiveConfig {
        &self.config
    }

    /// Build the cluster tree of `data`.
    ///
    /// # Returns
    /// * `None` for a dataset without observations
    /// * The root node otherwise; any failure inside a branch aborts the build
    pub fn fit(&self, data: ArrayView2<f64>) -> Result<Option<ClusterNode>> {
        if data.nrows() == 0 {
            return Ok(None);
        }
        validate_dataset(data)?;
        let limits = Limits {
            minimal_size: self.config.minimal_size.resolve(data.nrows())?,
            rejection_size: self.config.effective_rejection_size(data.nrows())?,
        };
        let build = || {
            let mut reporter = Reporter::new(self.progress);
            let selection = Array1::from_elem(data.nrows(), true);
            self.divide(data, &selection, limits, &mut reporter)
        };
        let root = match &self.pool {
            Some(pool) => pool.install(build)?,
            None => build()?,
        };
        Ok(Some(root))
    }

    fn divide(
        &self,
        data: ArrayView2<f64>,
        selection: &Array1<bool>,
        limits: Limits,
        reporter: &mut Reporter<'_>,
    ) -> Result<ClusterNode> {
        let rows = selected(selection);
        let subset = data.select(Axis(0), &rows);
        let kmeans = self.config.kmeans.kmeans();
        reporter.subset(&subset);

        let limit = self.config.kmeans.max_clusters().max(limits.minimal_size);
        if subset.nrows() <= limit {
            reporter.too_small(subset.nrows(), limit);
            let mask = Array1::from_elem(data.ncols(), true);
            return leaf(&subset, kmeans, mask, StopReason::TooSmall);
        }

        let feature_mask = self.config.feature_filter.fit(subset.view())?;
        let filtered = subset.select(Axis(1), &selected(&feature_mask));
        reporter.filtered(&filtered, kmeans.normalizes_rows());

        if let Some(fast) = &self.config.fast_kmeans {
            if fast.select(filtered.view())?.n_clusters() == Some(1) {
                reporter.stopped(filtered.nrows(), StopReason::NoStructure);
                return leaf(&filtered, kmeans, feature_mask, StopReason::NoStructure);
            }
        }

        let Some(model) = self.config.kmeans.select(filtered.view())?.best else {
            reporter.stopped(filtered.nrows(), StopReason::Unfit);
            return leaf(&filtered, kmeans, feature_mask, StopReason::Unfit);
        };
        if model.n_clusters == 1 {
            reporter.stopped(filtered.nrows(), StopReason::NoStructure);
            return leaf(&filtered, kmeans, feature_mask, StopReason::NoStructure);
        }

        let sizes = model.cluster_sizes();
        if sizes.iter().any(|&size| size <= limits.rejection_size) {
            reporter.rejected(filtered.nrows(), &sizes, limits.rejection_size);
            return leaf(&filtered, kmeans, feature_mask, StopReason::Rejected);
        }

        reporter.recurring(&sizes);
        let mut children = Vec::with_capacity(model.n_clusters);
        for label in 0..model.n_clusters {
            let branch = narrow(selection, &rows, &model.labels, label);
            children.push(self.divide(data, &branch, limits, reporter)?);
        }
        reporter.assembled(model.n_clusters);
        Ok(ClusterNode {
            model,
            feature_mask,
            stop: None,
            children,
        })
    }
}

/// Branch sizes resolved against the whole dataset
#[derive(Debug, Clone, Copy)]
struct Limits {
    minimal_size: usize,
    rejection_size: usize,
}

fn selected(mask: &Array1<bool>) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter(|(_, &keep)| keep)
        .map(|(idx, _)| idx)
        .collect()
}

/// Restrict `selection` to the rows whose local label is `label`
fn narrow(selection: &Array1<bool>, rows: &[usize], labels: &Array1<usize>, label: usize) -> Array1<bool> {
    let mut branch = selection.clone();
    for (&row, &assigned) in rows.iter().zip(labels.iter()) {
        if assigned != label {
            branch[row] = false;
        }
    }
    branch
}

fn leaf(
    data: &Array2<f64>,
    kmeans: &KMeans,
    mask: Array1<bool>,
    reason: StopReason,
) -> Result<ClusterNode> {
    Ok(ClusterNode::leaf(kmeans.single(data.view())?, mask, reason))
}

/// Logs the state transitions of one build and forwards leaf sizes to the sink
struct Reporter<'a> {
    progress: Option<&'a dyn ProgressSink>,
    paths_open: usize,
}

impl<'a> Reporter<'a> {
    fn new(progress: Option<&'a dyn ProgressSink>) -> Self {
        Self {
            progress,
            paths_open: 1,
        }
    }

    fn subset(&self, subset: &Array2<f64>) {
        debug!(rows = subset.nrows(), features = subset.ncols(), "processing branch");
    }

    fn filtered(&self, filtered: &Array2<f64>, normalize_rows: bool) {
        debug!(features = filtered.ncols(), "features after filtering");
        if normalize_rows {
            let constant = constant_rows(filtered.view());
            if !constant.is_empty() {
                warn!(
                    rows = constant.len(),
                    "feature filtering left constant rows, row normalization will fail"
                );
            }
        }
    }

    fn too_small(&mut self, size: usize, limit: usize) {
        debug!(size, limit, "branch below size limit");
        self.stopped(size, StopReason::TooSmall);
    }

    fn rejected(&mut self, size: usize, sizes: &[usize], rejection_size: usize) {
        info!(?sizes, rejection_size, "split rejected");
        self.stopped(size, StopReason::Rejected);
    }

    fn recurring(&mut self, sizes: &[usize]) {
        self.paths_open += sizes.len() - 1;
        info!(?sizes, paths_open = self.paths_open, "splitting branch");
    }

    fn assembled(&self, n_children: usize) {
        info!(n_children, paths_open = self.paths_open, "branch assembled");
    }

    fn stopped(&mut self, size: usize, reason: StopReason) {
        self.paths_open -= 1;
        info!(size, ?reason, paths_open = self.paths_open, "leaf finalized");
        if let Some(progress) = self.progress {
            progress.consumed(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::DunnSearch;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn separated_pairs() -> Array2<f64> {
        Array2::from_shape_fn((80, 2), |(i, j)| {
            let center = if i < 40 { 0.0 } else { 30.0 };
            let jitter = ((i * (j + 2)) as f64 * 0.71).sin() * 0.5;
            if j == 0 {
                center + jitter
            } else {
                jitter
            }
        })
    }

    fn dunn_config() -> DivisiveConfig {
        DivisiveConfig::default()
            .with_selector(ClusterCountSelector::Dunn(DunnSearch::default().with_range(2, 3)))
            .with_minimal_size(40)
    }

    #[test]
    fn test_empty_dataset_has_no_tree() {
        let data = Array2::<f64>::zeros((0, 3));
        let tree = DivisiveEngine::new(DivisiveConfig::default()).fit(data.view()).unwrap();
        assert!(tree.is_none());
    }

    #[test]
    fn test_nan_aborts_build() {
        let data = array![[1.0, f64::NAN], [2.0, 3.0]];
        assert!(DivisiveEngine::new(DivisiveConfig::default()).fit(data.view()).is_err());
    }

    #[test]
    fn test_small_dataset_is_leaf() {
        let data = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        let tree = DivisiveEngine::new(DivisiveConfig::default())
            .fit(data.view())
            .unwrap()
            .unwrap();
        assert!(tree.is_leaf());
        assert_eq!(tree.stop, Some(StopReason::TooSmall));
        assert_eq!(tree.model.n_clusters, 1);
        assert!((tree.model.centroids[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_two_groups_split_once() {
        let data = separated_pairs();
        let tree = DivisiveEngine::new(dunn_config()).fit(data.view()).unwrap().unwrap();
        assert_eq!(tree.children.len(), 2);
        assert!(tree.children.iter().all(|child| child.is_leaf()));
        assert!(tree.children.iter().all(|child| child.size() == 40));
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn test_progress_sums_to_dataset() {
        let data = separated_pairs();
        let total = AtomicUsize::new(0);
        let calls = Mutex::new(Vec::new());
        let sink = |n: usize| {
            total.fetch_add(n, Ordering::SeqCst);
            calls.lock().unwrap().push(n);
        };
        let tree = DivisiveEngine::new(dunn_config())
            .with_progress(&sink)
            .fit(data.view())
            .unwrap()
            .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 80);
        assert_eq!(calls.lock().unwrap().len(), tree.n_leaves());
    }

    #[test]
    fn test_rejection_turns_split_into_leaf() {
        let data = separated_pairs();
        let config = dunn_config().with_rejection_size(40);
        let tree = DivisiveEngine::new(config).fit(data.view()).unwrap().unwrap();
        assert!(tree.is_leaf());
        assert_eq!(tree.stop, Some(StopReason::Rejected));
    }

    #[test]
    fn test_effective_rejection_size() {
        let config = DivisiveConfig::default()
            .with_rejection_size(5)
            .with_rejection_percentage(Some(0.01));
        assert_eq!(config.effective_rejection_size(100).unwrap(), 5);
        assert_eq!(config.effective_rejection_size(2000).unwrap(), 20);
        let invalid = DivisiveConfig::default().with_rejection_percentage(Some(2.0));
        assert!(invalid.effective_rejection_size(10).is_err());
    }

    #[test]
    fn test_minimal_size_fraction() {
        assert_eq!(MinimalSize::default().resolve(5000).unwrap(), 5);
        assert_eq!(MinimalSize::Fraction(0.25).resolve(81).unwrap(), 20);
        assert_eq!(MinimalSize::Absolute(7).resolve(81).unwrap(), 7);
        assert!(MinimalSize::Fraction(1.5).resolve(81).is_err());

        assert_eq!("40".parse::<MinimalSize>().unwrap(), MinimalSize::Absolute(40));
        assert_eq!("0.05".parse::<MinimalSize>().unwrap(), MinimalSize::Fraction(0.05));
        assert!("1.5".parse::<MinimalSize>().is_err());
        assert!("many".parse::<MinimalSize>().is_err());
    }

    #[test]
    fn test_fractional_minimal_size_stops_children() {
        let data = separated_pairs();
        let config = dunn_config().with_minimal_rate(0.5);
        let tree = DivisiveEngine::new(config).fit(data.view()).unwrap().unwrap();
        assert_eq!(tree.children.len(), 2);
        assert!(tree
            .children
            .iter()
            .all(|child| child.stop == Some(StopReason::TooSmall)));

        let whole = dunn_config().with_minimal_rate(1.0);
        let tree = DivisiveEngine::new(whole).fit(data.view()).unwrap().unwrap();
        assert_eq!(tree.stop, Some(StopReason::TooSmall));
    }

    #[test]
    fn test_leaf_centroid_in_normalized_space() {
        let data = array![[1.0, 2.0, 3.0], [2.0, 4.0, 9.0], [0.0, 5.0, 1.0]];
        let kmeans = KMeans::default().with_normalize_rows(true);
        let config = DivisiveConfig::default()
            .with_selector(ClusterCountSelector::Gap(GapSearch::default().with_kmeans(kmeans)));
        let tree = DivisiveEngine::new(config).fit(data.view()).unwrap().unwrap();
        assert_eq!(tree.stop, Some(StopReason::TooSmall));
        assert!(tree.model.normalize_rows);

        let expected = crate::kmeans::normalize_rows(data.view())
            .unwrap()
            .mean_axis(Axis(0))
            .unwrap();
        for (got, want) in tree.model.centroids.row(0).iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_narrow_keeps_label_rows() {
        let selection = array![true, false, true, true];
        let labels = array![1, 0, 1];
        let branch = narrow(&selection, &[0, 2, 3], &labels, 1);
        assert_eq!(branch, array![true, false, false, true]);
    }
}
