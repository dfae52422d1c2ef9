//! Loading dense numeric datasets using Polars

use ndarray::Array2;
use polars::prelude::*;
use std::path::Path;

/// Load a CSV file of numeric columns into an `(n_observations, n_features)` matrix
///
/// # Arguments
/// * `file_path` - Path to the CSV file
/// * `has_header` - Whether the first line holds column names
///
/// # Returns
/// * The observations as `f64`, failing on null, NaN or non-numeric cells
pub fn load_dataset(file_path: impl AsRef<Path>, has_header: bool) -> anyhow::Result<Array2<f64>> {
    let path = file_path.as_ref();
    let df = CsvReadOptions::default()
        .with_has_header(has_header)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    if df.height() == 0 {
        anyhow::bail!("No observations found in {}", path.display());
    }

    let nulls: usize = df.get_columns().iter().map(|column| column.null_count()).sum();
    if nulls > 0 {
        anyhow::bail!("{} contains {} empty cell(s)", path.display(), nulls);
    }

    let features = df.to_ndarray::<Float64Type>(IndexOrder::C)?;
    let nans = features.iter().filter(|v| v.is_nan()).count();
    if nans > 0 {
        anyhow::bail!("{} contains {} NaN value(s)", path.display(), nans);
    }
    Ok(features)
}
