//! Error types shared by every clustering stage

use thiserror::Error;

/// Errors raised while building or querying a cluster tree.
#[derive(Debug, Error)]
pub enum DivisiveError {
    /// Two arrays disagree on a dimension that must match.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A configuration value or call argument is out of range.
    #[error("invalid argument `{arg}`: {reason}")]
    InvalidArgument { arg: &'static str, reason: String },

    #[error("unknown distance metric `{0}`")]
    UnknownDistance(String),

    #[error("dataset contains {count} NaN value(s)")]
    NanValues { count: usize },

    #[error("dataset has no observations")]
    EmptyDataset,

    /// Row normalization divides by the row norm, constant rows cannot be scaled.
    #[error("{} constant row(s) cannot be normalized, first at index {}", rows.len(), rows.first().copied().unwrap_or_default())]
    ConstantRows { rows: Vec<usize> },

    #[error("eigendecomposition failed: {0}")]
    Decomposition(String),

    #[error("mixture decomposition failed: {0}")]
    MixtureFit(String),

    #[error("characteristic has negative values and cannot be log-transformed")]
    NegativeCharacteristic,
}

impl DivisiveError {
    /// Whether a caller may fall back (e.g. disable filtering) instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DivisiveError::ConstantRows { .. }
                | DivisiveError::MixtureFit(_)
                | DivisiveError::NegativeCharacteristic
        )
    }
}
