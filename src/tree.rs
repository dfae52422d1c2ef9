//! The cluster tree and its summary queries

use crate::error::DivisiveError;
use crate::kmeans::{normalize_rows, KMeansModel};
use crate::Result;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::BTreeMap;

/// Why a branch was not split further
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Branch not larger than the minimal size or the largest candidate k
    TooSmall,
    /// The cluster-count search found a single cluster
    NoStructure,
    /// No candidate number of clusters qualified
    Unfit,
    /// The proposed split contained a cluster at or below the rejection size
    Rejected,
}

/// One node of the divisive tree.
///
/// Leaves carry a single-cluster model and the reason they stopped; internal
/// nodes have exactly one child per label of their model.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    /// Partition of the branch, labels local to the branch
    pub model: KMeansModel,
    /// Features the model was fit on, over all input features
    pub feature_mask: Array1<bool>,
    pub stop: Option<StopReason>,
    pub children: Vec<ClusterNode>,
}

/// Flattened labels of a tree cut at some depth
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPartition {
    pub labels: Array1<usize>,
    /// Merged label -> child index taken at every level
    pub paths: BTreeMap<usize, Vec<usize>>,
    /// Centroid of every merged cluster, over the features kept by its row of `filters`
    pub centroids: Vec<Array1<f64>>,
    /// Features of the split that produced every merged cluster
    pub filters: Array2<bool>,
}

/// One merged cluster as found while walking the tree
struct MergedCluster {
    path: Vec<usize>,
    centroid: Array1<f64>,
    filter: Array1<bool>,
}

impl MergedPartition {
    /// Path -> merged label
    pub fn reverse_paths(&self) -> BTreeMap<Vec<usize>, usize> {
        self.paths
            .iter()
            .map(|(&label, path)| (path.clone(), label))
            .collect()
    }

    pub fn n_clusters(&self) -> usize {
        self.paths.len()
    }
}

impl ClusterNode {
    pub fn leaf(model: KMeansModel, feature_mask: Array1<bool>, reason: StopReason) -> Self {
        Self {
            model,
            feature_mask,
            stop: Some(reason),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of observations in the branch
    pub fn size(&self) -> usize {
        self.model.labels.len()
    }

    /// Leaf = 1, otherwise one more than the deepest child
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(ClusterNode::depth).max().unwrap_or(0)
    }

    pub fn n_leaves(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.children.iter().map(ClusterNode::n_leaves).sum()
        }
    }

    /// Merge every branch below `levels_limit` levels into flat labels.
    ///
    /// `None` keeps the full depth. A root leaf yields a single cluster with
    /// path `[0]`.
    pub fn merged_partition(&self, levels_limit: Option<usize>) -> MergedPartition {
        let (labels, clusters) = if self.is_leaf() {
            let root = MergedCluster {
                path: vec![0],
                centroid: self.model.centroids.row(0).to_owned(),
                filter: self.feature_mask.clone(),
            };
            (Array1::zeros(self.size()), vec![root])
        } else {
            merge(self, levels_limit.unwrap_or(usize::MAX).max(1))
        };
        let n_features = self.feature_mask.len();
        let filters = Array2::from_shape_fn((clusters.len(), n_features), |(label, feature)| {
            clusters[label].filter[feature]
        });
        let mut paths = BTreeMap::new();
        let mut centroids = Vec::with_capacity(clusters.len());
        for (label, cluster) in clusters.into_iter().enumerate() {
            paths.insert(label, cluster.path);
            centroids.push(cluster.centroid);
        }
        MergedPartition {
            labels,
            paths,
            centroids,
            filters,
        }
    }

    /// Distance of every row to every merged cluster's centroid.
    ///
    /// Each distance is measured on the features that cluster's split used,
    /// after row normalization when the models normalize rows.
    pub fn transform(&self, data: ArrayView2<f64>, levels_limit: Option<usize>) -> Result<Array2<f64>> {
        if data.ncols() != self.feature_mask.len() {
            return Err(DivisiveError::Shape(format!(
                "tree was built on {} features, got {}",
                self.feature_mask.len(),
                data.ncols()
            )));
        }
        let partition = self.merged_partition(levels_limit);
        let mut distances = Array2::zeros((data.nrows(), partition.n_clusters()));
        for (label, centroid) in partition.centroids.iter().enumerate() {
            let features: Vec<usize> = partition
                .filters
                .row(label)
                .iter()
                .enumerate()
                .filter(|(_, &keep)| keep)
                .map(|(idx, _)| idx)
                .collect();
            let subset = data.select(Axis(1), &features);
            let space = if self.model.normalize_rows {
                normalize_rows(subset.view())?
            } else {
                subset
            };
            let column = self
                .model
                .distance
                .cdist(space.view(), centroid.view().insert_axis(Axis(0)))?;
            distances.column_mut(label).assign(&column.column(0));
        }
        Ok(distances)
    }

    /// Child indices taken while walking `row` down the tree
    pub fn predict_path(&self, row: ArrayView1<f64>) -> Result<Vec<usize>> {
        if row.len() != self.feature_mask.len() {
            return Err(DivisiveError::Shape(format!(
                "tree was built on {} features, got {}",
                self.feature_mask.len(),
                row.len()
            )));
        }
        if self.is_leaf() {
            return Ok(vec![0]);
        }
        let mut path = Vec::new();
        let mut node = self;
        while !node.is_leaf() {
            let features: Vec<usize> = node
                .feature_mask
                .iter()
                .enumerate()
                .filter(|(_, &keep)| keep)
                .map(|(idx, _)| idx)
                .collect();
            let observation = row.select(Axis(0), &features).insert_axis(Axis(0));
            let label = node.model.predict(observation.view())?[0];
            path.push(label);
            node = &node.children[label];
        }
        Ok(path)
    }

    /// Merged labels of new observations
    pub fn predict(&self, data: ArrayView2<f64>, levels_limit: Option<usize>) -> Result<Array1<usize>> {
        let limit = levels_limit.unwrap_or(usize::MAX).max(1);
        let reverse = self.merged_partition(levels_limit).reverse_paths();
        let labels = data
            .outer_iter()
            .map(|row| {
                let mut path = self.predict_path(row)?;
                path.truncate(limit);
                reverse.get(&path).copied().ok_or_else(|| {
                    DivisiveError::Shape(format!("no merged cluster for path {path:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Array1::from(labels))
    }
}

fn merge(node: &ClusterNode, levels_limit: usize) -> (Array1<usize>, Vec<MergedCluster>) {
    let labels = &node.model.labels;
    let mut merged = Array1::zeros(labels.len());
    let mut clusters = Vec::new();
    for (cluster, child) in node.children.iter().enumerate() {
        let rows: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == cluster)
            .map(|(row, _)| row)
            .collect();
        let known = clusters.len();
        if child.is_leaf() || levels_limit <= 1 {
            for &row in &rows {
                merged[row] = known;
            }
            clusters.push(MergedCluster {
                path: vec![cluster],
                centroid: node.model.centroids.row(cluster).to_owned(),
                filter: node.feature_mask.clone(),
            });
        } else {
            let (local, down) = merge(child, levels_limit - 1);
            for (&row, &label) in rows.iter().zip(local.iter()) {
                merged[row] = label + known;
            }
            clusters.extend(down.into_iter().map(|mut below| {
                below.path.insert(0, cluster);
                below
            }));
        }
    }
    (merged, clusters)
}
