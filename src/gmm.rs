//! Candidate thresholds from a one-dimensional Gaussian mixture

use crate::error::DivisiveError;
use crate::Result;
use linfa::prelude::*;
use linfa_clustering::GaussianMixtureModel;
use ndarray::{Array1, ArrayView1, Axis};
use std::f64::consts::PI;
use tracing::debug;

const BISECTION_STEPS: usize = 100;

/// One fitted mixture component in the original value scale
#[derive(Debug, Clone, Copy, PartialEq)]
struct Component {
    weight: f64,
    mean: f64,
    variance: f64,
}

impl Component {
    fn log_density(&self, x: f64) -> f64 {
        self.weight.ln() - 0.5 * (2.0 * PI * self.variance).ln()
            - (x - self.mean).powi(2) / (2.0 * self.variance)
    }
}

/// Decompose `values` into Gaussian components and return the crossing points
/// of adjacent weighted densities, in increasing order.
///
/// The number of components (up to `max_components`) is picked by BIC.
///
/// # Returns
/// * Empty for empty or constant input
/// * [`DivisiveError::MixtureFit`] when no mixture could be fit
pub fn find_gmm_thresholds(values: ArrayView1<f64>, max_components: usize) -> Result<Vec<f64>> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() != values.len() {
        return Err(DivisiveError::MixtureFit(format!(
            "{} non-finite value(s)",
            values.len() - finite.len()
        )));
    }
    if finite.is_empty() {
        return Ok(Vec::new());
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let std = (finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std == 0.0 {
        return Ok(Vec::new());
    }

    let mut distinct = finite.clone();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();
    let max_components = max_components.min(distinct.len()).max(1);

    // fit in standardized units, map back afterwards
    let standardized = Array1::from_iter(finite.iter().map(|v| (v - mean) / std));
    let dataset = DatasetBase::from(standardized.clone().insert_axis(Axis(1)));

    let mut best: Option<(f64, Vec<Component>)> = None;
    let mut last_error = None;
    for n_components in 1..=max_components {
        let fitted = GaussianMixtureModel::<f64>::params(n_components)
            .n_runs(1)
            .tolerance(1e-6)
            .max_n_iterations(500)
            .fit(&dataset);
        let model = match fitted {
            Ok(model) => model,
            Err(err) => {
                debug!(n_components, %err, "mixture fit failed");
                last_error = Some(err.to_string());
                continue;
            }
        };
        let components: Vec<Component> = (0..n_components)
            .map(|c| Component {
                weight: model.weights()[c],
                mean: model.means()[[c, 0]],
                variance: model.covariances()[[c, 0, 0]],
            })
            .collect();
        if components
            .iter()
            .any(|c| !(c.weight > 0.0 && c.variance > 0.0 && c.mean.is_finite()))
        {
            continue;
        }
        let bic = bic(&components, standardized.view());
        debug!(n_components, bic, "mixture fitted");
        if best.as_ref().map_or(true, |(score, _)| bic < *score) {
            best = Some((bic, components));
        }
    }

    let (_, mut components) = best.ok_or_else(|| {
        DivisiveError::MixtureFit(last_error.unwrap_or_else(|| "degenerate components".into()))
    })?;
    components.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    let thresholds = components
        .windows(2)
        .filter_map(|pair| crossing(&pair[0], &pair[1]))
        .map(|z| z * std + mean)
        .collect();
    Ok(thresholds)
}

fn log_likelihood(components: &[Component], values: ArrayView1<f64>) -> f64 {
    values
        .iter()
        .map(|&x| {
            let logs: Vec<f64> = components.iter().map(|c| c.log_density(x)).collect();
            let top = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            top + logs.iter().map(|l| (l - top).exp()).sum::<f64>().ln()
        })
        .sum()
}

fn bic(components: &[Component], values: ArrayView1<f64>) -> f64 {
    let parameters = (3 * components.len() - 1) as f64;
    -2.0 * log_likelihood(components, values) + parameters * (values.len() as f64).ln()
}

/// Point between the two means where the weighted densities are equal
fn crossing(left: &Component, right: &Component) -> Option<f64> {
    let balance = |x: f64| left.log_density(x) - right.log_density(x);
    let (mut low, mut high) = (left.mean, right.mean);
    if !(balance(low) > 0.0 && balance(high) < 0.0) {
        return None;
    }
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (low + high);
        if balance(mid) > 0.0 {
            low = mid;
        } else {
            high = mid;
        }
    }
    Some(0.5 * (low + high))
}
