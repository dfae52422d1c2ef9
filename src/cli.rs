//! Command-line interface definitions and argument parsing

use crate::distance::DistanceMetric;
use crate::engine::{DivisiveConfig, MinimalSize};
use crate::feature_selection::{
    FeatureFilter, HighAbundanceAndVarianceSelector, OutlierAbundanceAndVarianceSelector,
};
use crate::initialization::{Initialization, LeafSize};
use crate::kmeans::KMeans;
use crate::search::{ClusterCountSelector, DunnSearch, GapSearch};
use clap::{Parser, ValueEnum};
use tracing::Level;

/// How the number of clusters of every split is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SelectorKind {
    Gap,
    Dunn,
}

/// Feature filtering applied before every split
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterKind {
    /// Gaussian mixture thresholds on abundance and variance
    Gmm,
    /// Adjusted-boxplot outliers of abundance and variance
    Outlier,
    /// `gmm` above 250 features, `outlier` otherwise
    Auto,
    None,
}

/// Seed selection strategy for k-means
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InitKind {
    Extreme,
    Percentile,
    Kdtree,
}

/// Divisive hierarchical clustering of a numeric CSV dataset
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input CSV file, one observation per row
    #[arg(short, long)]
    pub input: String,

    /// Largest number of clusters considered at every split
    #[arg(short = 'k', long, default_value = "10")]
    pub k_max: usize,

    /// Distance metric (euclidean, sqeuclidean, cityblock, chebyshev, cosine, correlation)
    #[arg(short, long, default_value = "euclidean")]
    pub distance: DistanceMetric,

    /// Cluster-count selection criterion
    #[arg(short, long, value_enum, default_value = "gap")]
    pub selector: SelectorKind,

    /// Feature filtering before every split
    #[arg(short, long, value_enum, default_value = "none")]
    pub filter: FilterKind,

    /// Branches with at most this many observations are not split; a value
    /// between 0 and 1 is a fraction of the rows (default: 0.001)
    #[arg(long)]
    pub minimal_size: Option<MinimalSize>,

    /// Reject splits producing a cluster of at most this many observations
    #[arg(long, default_value = "0")]
    pub rejection_size: usize,

    /// Reference datasets (GAP) or subsamples (Dunn) per candidate
    #[arg(long, default_value = "10")]
    pub gap_trials: usize,

    /// Observations per subsample when subsampled scores are cheaper
    #[arg(long, default_value = "1000")]
    pub sample_size: usize,

    /// Root seed of every random step
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Worker threads (default: all cores)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Maximum iterations for K-Means algorithm
    #[arg(long, default_value = "100")]
    pub max_iters: usize,

    /// Seed selection strategy
    #[arg(long, value_enum, default_value = "percentile")]
    pub init: InitKind,

    /// Percentile of the deviation score used to pick the first seed
    #[arg(long, default_value = "95")]
    pub percentile: f64,

    /// Center and scale every observation to unit norm before clustering
    /// (default: only with the correlation distance)
    #[arg(long)]
    pub normalize_rows: bool,

    /// Never normalize observations, even with the correlation distance
    #[arg(long, conflicts_with = "normalize_rows")]
    pub no_normalize_rows: bool,

    /// Stop a branch early when a two-candidate GAP check finds no structure
    #[arg(long)]
    pub fast_check: bool,

    /// Number of tree levels merged into the reported partition (default: all)
    #[arg(long)]
    pub levels: Option<usize>,

    /// The input file has no header line
    #[arg(long)]
    pub no_header: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    }

    pub fn kmeans(&self) -> KMeans {
        let init = match self.init {
            InitKind::Extreme => Initialization::Extreme,
            InitKind::Percentile => Initialization::Percentile {
                percentile: self.percentile,
            },
            InitKind::Kdtree => Initialization::KdTree {
                leaf_size: LeafSize::Fraction(0.01),
                percentile: self.percentile,
            },
        };
        let kmeans = KMeans::default()
            .with_distance(self.distance)
            .with_init(init)
            .with_max_iter(self.max_iters);
        if self.normalize_rows {
            kmeans.with_normalize_rows(true)
        } else if self.no_normalize_rows {
            kmeans.with_normalize_rows(false)
        } else {
            kmeans
        }
    }

    pub fn selector(&self) -> ClusterCountSelector {
        match self.selector {
            SelectorKind::Gap => ClusterCountSelector::Gap(
                GapSearch::default()
                    .with_kmeans(self.kmeans())
                    .with_range(1, self.k_max)
                    .with_trials(self.gap_trials)
                    .with_sample_size(self.sample_size)
                    .with_seed(self.seed),
            ),
            SelectorKind::Dunn => ClusterCountSelector::Dunn(
                DunnSearch::default()
                    .with_kmeans(self.kmeans())
                    .with_range(2, self.k_max)
                    .with_trials(self.gap_trials)
                    .with_sample_size(self.sample_size)
                    .with_seed(self.seed),
            ),
        }
    }

    pub fn feature_filter(&self, n_features: usize) -> FeatureFilter {
        match self.filter {
            FilterKind::Gmm => FeatureFilter::Gmm(HighAbundanceAndVarianceSelector::default()),
            FilterKind::Outlier => {
                FeatureFilter::Outlier(OutlierAbundanceAndVarianceSelector::default())
            }
            FilterKind::Auto => FeatureFilter::auto(n_features),
            FilterKind::None => FeatureFilter::None,
        }
    }

    /// Engine configuration for a dataset with `n_features` columns
    pub fn config(&self, n_features: usize) -> DivisiveConfig {
        let fast = self.fast_check.then(|| {
            GapSearch::fast(self.kmeans())
                .with_trials(self.gap_trials)
                .with_sample_size(self.sample_size)
                .with_seed(self.seed)
        });
        DivisiveConfig {
            minimal_size: self.minimal_size.unwrap_or_default(),
            ..DivisiveConfig::default()
        }
        .with_selector(self.selector())
        .with_fast_kmeans(fast)
        .with_feature_filter(self.feature_filter(n_features))
        .with_rejection_size(self.rejection_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["divisive", "--input", "data.csv"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.k_max, 10);
        assert_eq!(args.distance, DistanceMetric::Euclidean);
        assert_eq!(args.selector, SelectorKind::Gap);
        assert_eq!(args.log_level(), Level::WARN);

        let config = args.config(3);
        assert_eq!(config.minimal_size.resolve(5000).unwrap(), 5);
        assert!(!config.kmeans.kmeans().normalizes_rows());
        assert!(config.fast_kmeans.is_none());
        assert_eq!(config.feature_filter, FeatureFilter::None);
        assert!(config.kmeans.is_gap());
    }

    #[test]
    fn test_dunn_with_options() {
        let args = parse(&[
            "--selector",
            "dunn",
            "-k",
            "6",
            "--distance",
            "cosine",
            "--minimal-size",
            "50",
            "--fast-check",
            "--filter",
            "auto",
            "-vv",
        ]);
        let config = args.config(300);
        assert_eq!(config.minimal_size, MinimalSize::Absolute(50));
        assert!(config.fast_kmeans.is_some());
        assert!(matches!(config.feature_filter, FeatureFilter::Gmm(_)));
        assert_eq!(config.kmeans.max_clusters(), 6);
        assert_eq!(config.kmeans.kmeans().distance, DistanceMetric::Cosine);
        assert_eq!(args.log_level(), Level::DEBUG);
    }

    #[test]
    fn test_fractional_minimal_size() {
        let config = parse(&["--minimal-size", "0.05"]).config(2);
        assert_eq!(config.minimal_size, MinimalSize::Fraction(0.05));
        assert_eq!(config.minimal_size.resolve(400).unwrap(), 20);
        let argv = ["divisive", "--input", "data.csv", "--minimal-size", "-3"];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_correlation_normalizes_unless_disabled() {
        let args = parse(&["--distance", "correlation"]);
        assert!(args.kmeans().normalizes_rows());
        let args = parse(&["--distance", "correlation", "--no-normalize-rows"]);
        assert!(!args.kmeans().normalizes_rows());
        let args = parse(&["--normalize-rows"]);
        assert!(args.kmeans().normalizes_rows());
        let argv = [
            "divisive",
            "--input",
            "data.csv",
            "--normalize-rows",
            "--no-normalize-rows",
        ];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_rejects_unknown_distance() {
        let argv = ["divisive", "--input", "data.csv", "--distance", "hamming"];
        assert!(Args::try_parse_from(argv).is_err());
    }
}
