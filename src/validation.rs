//! Argument checks shared by the estimators.

use crate::error::DivisiveError;
use crate::Result;
use ndarray::ArrayView2;

/// Validate that a dataset has rows and no NaN cells.
pub fn validate_dataset(data: ArrayView2<f64>) -> Result<()> {
    if data.nrows() == 0 {
        return Err(DivisiveError::EmptyDataset);
    }
    let count = data.iter().filter(|v| v.is_nan()).count();
    if count > 0 {
        return Err(DivisiveError::NanValues { count });
    }
    Ok(())
}

/// Validate n_clusters against the number of observations.
pub fn validate_n_clusters(n_clusters: usize, n_points: usize, op: &'static str) -> Result<()> {
    if n_clusters == 0 {
        return Err(DivisiveError::InvalidArgument {
            arg: "n_clusters",
            reason: format!("{op} requires n_clusters > 0"),
        });
    }
    if n_clusters > n_points {
        return Err(DivisiveError::InvalidArgument {
            arg: "n_clusters",
            reason: format!("{op}: n_clusters={n_clusters} exceeds number of points {n_points}"),
        });
    }
    Ok(())
}

/// Validate a percentile in [0, 100].
pub fn validate_percentile(percentile: f64, op: &'static str) -> Result<()> {
    if !(0.0..=100.0).contains(&percentile) {
        return Err(DivisiveError::InvalidArgument {
            arg: "percentile",
            reason: format!("{op} requires percentile in [0, 100], got {percentile}"),
        });
    }
    Ok(())
}

/// Validate an inclusive cluster-count range.
pub fn validate_k_range(min: usize, max: usize, op: &'static str) -> Result<()> {
    if min == 0 || max < min {
        return Err(DivisiveError::InvalidArgument {
            arg: "max_clusters",
            reason: format!("{op} requires 1 <= min_clusters <= max_clusters, got {min}..={max}"),
        });
    }
    Ok(())
}

/// Validate a fraction in [0, 1].
pub fn validate_rate(rate: f64, arg: &'static str, op: &'static str) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(DivisiveError::InvalidArgument {
            arg,
            reason: format!("{op} requires {arg} in [0, 1], got {rate}"),
        });
    }
    Ok(())
}
