//! Robust one-dimensional statistics used by the feature filters

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Quantile with linear interpolation between order statistics.
///
/// `q` is a fraction in `[0, 1]`. Returns NaN for an empty input.
pub fn quantile(values: ArrayView1<f64>, q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    quantile_sorted(&sorted, q)
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Medcouple robust measure of skewness.
///
/// Direct O(n²) kernel evaluation; observations tied with the median get the
/// sign kernel of Hubert & Vandervieren.
pub fn medcouple(values: ArrayView1<f64>) -> f64 {
    let mut sorted = values.to_vec();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(f64::total_cmp);
    let med = quantile_sorted(&sorted, 0.5);
    let centered: Vec<f64> = sorted.iter().map(|v| v - med).collect();
    let lower: Vec<f64> = centered.iter().copied().filter(|&z| z <= 0.0).collect();
    let upper: Vec<f64> = centered.iter().copied().filter(|&z| z >= 0.0).collect();
    let ties = lower.iter().filter(|&&z| z == 0.0).count();

    let mut kernel = Vec::with_capacity(lower.len() * upper.len());
    for (i, &up) in upper.iter().enumerate() {
        for (j, &low) in lower.iter().enumerate() {
            let h = if up == 0.0 && low == 0.0 {
                // ties occupy the first upper rows and the last lower columns
                let a = i;
                let b = j + ties - lower.len();
                match (a + b).cmp(&(ties - 1)) {
                    std::cmp::Ordering::Less => -1.0,
                    std::cmp::Ordering::Equal => 0.0,
                    std::cmp::Ordering::Greater => 1.0,
                }
            } else {
                (up + low) / (up - low)
            };
            kernel.push(h);
        }
    }
    kernel.sort_by(f64::total_cmp);
    let n = kernel.len();
    if n % 2 == 1 {
        kernel[n / 2]
    } else {
        (kernel[n / 2 - 1] + kernel[n / 2]) / 2.0
    }
}

/// Whisker bounds of the skewness-adjusted box plot
///
/// # Returns
/// * `(lower, upper)`; values outside are outliers
pub fn adjusted_boxplot_bounds(values: ArrayView1<f64>) -> (f64, f64) {
    let q1 = quantile(values, 0.25);
    let q3 = quantile(values, 0.75);
    let iqr = q3 - q1;
    let mc = medcouple(values);
    let (low_exp, high_exp) = if mc >= 0.0 { (-4.0, 3.0) } else { (-3.0, 4.0) };
    (
        q1 - 1.5 * (low_exp * mc).exp() * iqr,
        q3 + 1.5 * (high_exp * mc).exp() * iqr,
    )
}

/// Per-column mean
pub fn column_means(data: ArrayView2<f64>) -> Array1<f64> {
    data.mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::from_elem(data.ncols(), f64::NAN))
}

/// Per-column population variance
pub fn column_variances(data: ArrayView2<f64>) -> Array1<f64> {
    if data.nrows() == 0 {
        return Array1::from_elem(data.ncols(), f64::NAN);
    }
    data.var_axis(Axis(0), 0.0)
}

/// Population mean and standard deviation of a slice
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
