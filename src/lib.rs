//! Divisive: top-down hierarchical clustering
//!
//! A dataset is split recursively with k-means. At every node the number of
//! clusters is chosen with the GAP statistic or the Dunn index, features can be
//! filtered to the informative ones, and a branch stops when it is too small,
//! shows no structure or would produce a tiny cluster.

pub mod cli;
pub mod data;
pub mod distance;
pub mod engine;
pub mod error;
pub mod feature_selection;
pub mod gmm;
pub mod initialization;
pub mod kmeans;
pub mod sampler;
pub mod score;
pub mod search;
pub mod stats;
pub mod tree;
pub mod validation;

// Re-export public items for easier access
pub use cli::Args;
pub use data::load_dataset;
pub use distance::DistanceMetric;
pub use engine::{DivisiveConfig, DivisiveEngine, MinimalSize, ProgressSink};
pub use error::DivisiveError;
pub use feature_selection::{
    FeatureFilter, FeatureSelector, GmmSelector, HighAbundanceAndVarianceSelector,
    OutlierAbundanceAndVarianceSelector, OutlierSelector,
};
pub use gmm::find_gmm_thresholds;
pub use initialization::{Initialization, LeafSize};
pub use kmeans::{KMeans, KMeansModel};
pub use search::{ClusterCountSelector, DunnSearch, GapSearch, Selection};
pub use tree::{ClusterNode, MergedPartition, StopReason};

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, DivisiveError>;
