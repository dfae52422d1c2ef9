//! Data-driven selection of informative features
//!
//! Selectors are immutable configuration values. `fit` computes a per-feature
//! characteristic (mean, variance...) of the current subset and returns the
//! mask of features worth clustering on.

use crate::error::DivisiveError;
use crate::gmm::find_gmm_thresholds;
use crate::stats::{adjusted_boxplot_bounds, column_means, column_variances, quantile};
use crate::validation::validate_rate;
use crate::Result;
use ndarray::{Array1, ArrayView2, Axis};
use tracing::{debug, warn};

const EPS: f64 = 1e-5;

/// Produces a feature mask for a data subset
pub trait FeatureSelector {
    fn fit(&self, data: ArrayView2<f64>) -> Result<Array1<bool>>;
}

/// Per-feature statistic the selectors threshold on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Mean,
    Variance,
    /// Standard deviation over mean
    CoefficientOfVariation,
}

impl Characteristic {
    /// Compute the statistic for every column, optionally log-transformed.
    pub fn compute(&self, data: ArrayView2<f64>, use_log: bool) -> Result<Array1<f64>> {
        let values = match self {
            Characteristic::Mean => column_means(data),
            Characteristic::Variance => column_variances(data),
            Characteristic::CoefficientOfVariation => {
                let means = column_means(data);
                column_variances(data).mapv(f64::sqrt) / means
            }
        };
        if !use_log {
            return Ok(values);
        }
        if values.iter().any(|&v| v < 0.0) {
            return Err(DivisiveError::NegativeCharacteristic);
        }
        Ok(values.mapv(f64::ln))
    }
}

fn count(mask: &Array1<bool>) -> usize {
    mask.iter().filter(|&&selected| selected).count()
}

fn selected_indices(mask: &Array1<bool>) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter(|(_, &selected)| selected)
        .map(|(idx, _)| idx)
        .collect()
}

/// Write `inner` into the `true` positions of `outer`.
fn refine(outer: &mut Array1<bool>, inner: &Array1<bool>) {
    let positions = selected_indices(outer);
    for (&position, &keep) in positions.iter().zip(inner.iter()) {
        outer[position] = keep;
    }
}

/// Thresholds the characteristic at a crossing of a Gaussian mixture fit
#[derive(Debug, Clone, PartialEq)]
pub struct GmmSelector {
    pub stat: Characteristic,
    pub use_log: bool,
    /// Keep high values; when false the characteristic is negated first
    pub preserve_high: bool,
    /// How many of the lowest thresholds to consider; negative drops from the end
    pub n_candidates: Option<isize>,
    pub min_features: usize,
    pub min_features_rate: f64,
    pub max_components: usize,
}

impl GmmSelector {
    pub fn new(stat: Characteristic) -> Self {
        Self {
            stat,
            use_log: false,
            preserve_high: true,
            n_candidates: None,
            min_features: 1,
            min_features_rate: 0.0,
            max_components: 10,
        }
    }

    fn candidates(&self, mut thresholds: Vec<f64>) -> Vec<f64> {
        let keep = match self.n_candidates {
            None => thresholds.len(),
            Some(n) if n >= 0 => (n as usize).min(thresholds.len()),
            Some(n) => thresholds.len().saturating_sub(n.unsigned_abs()),
        };
        thresholds.truncate(keep);
        thresholds
    }
}

impl FeatureSelector for GmmSelector {
    fn fit(&self, data: ArrayView2<f64>) -> Result<Array1<bool>> {
        validate_rate(self.min_features_rate, "min_features_rate", "gmm selector")?;
        let mut values = self.stat.compute(data, self.use_log)?;
        if !self.preserve_high {
            values.mapv_inplace(|v| -v);
        }
        let thresholds = match find_gmm_thresholds(values.view(), self.max_components) {
            Ok(thresholds) => thresholds,
            Err(err) => {
                warn!(%err, "no thresholds available, keeping all features");
                Vec::new()
            }
        };
        let required =
            (self.min_features as f64).max(self.min_features_rate * values.len() as f64);
        for threshold in self.candidates(thresholds).into_iter().rev() {
            let mask = values.mapv(|v| v >= threshold);
            if count(&mask) as f64 >= required {
                debug!(threshold, selected = count(&mask), "gmm threshold accepted");
                return Ok(mask);
            }
        }
        Ok(Array1::from_elem(values.len(), true))
    }
}

/// Which tail of the distribution counts as outlying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierSide {
    Both,
    Low,
    High,
}

/// Adjusted box-plot outlier detection on the characteristic
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierSelector {
    pub stat: Characteristic,
    pub use_log: bool,
    pub side: OutlierSide,
    /// Keep the outliers instead of removing them
    pub keep_outliers: bool,
}

impl FeatureSelector for OutlierSelector {
    fn fit(&self, data: ArrayView2<f64>) -> Result<Array1<bool>> {
        let values = self.stat.compute(data, self.use_log)?;
        let (lower, upper) = adjusted_boxplot_bounds(values.view());
        let outliers = values.mapv(|v| match self.side {
            OutlierSide::Both => v < lower || v > upper,
            OutlierSide::Low => v < lower,
            OutlierSide::High => v > upper,
        });
        if self.keep_outliers {
            Ok(outliers)
        } else {
            Ok(outliers.mapv(|outlier| !outlier))
        }
    }
}

/// Keeps a fixed fraction of features ranked by the characteristic
#[derive(Debug, Clone, PartialEq)]
pub struct PercentageSelector {
    pub stat: Characteristic,
    pub use_log: bool,
    pub keep_top: bool,
    /// Fraction of features to keep
    pub p: f64,
}

impl FeatureSelector for PercentageSelector {
    fn fit(&self, data: ArrayView2<f64>) -> Result<Array1<bool>> {
        validate_rate(self.p, "p", "percentage selector")?;
        let values = self.stat.compute(data, self.use_log)?;
        if self.keep_top {
            let threshold = quantile(values.view(), 1.0 - self.p);
            Ok(values.mapv(|v| v >= threshold))
        } else {
            let threshold = quantile(values.view(), self.p);
            Ok(values.mapv(|v| v <= threshold))
        }
    }
}

/// GMM-based composite: keeps abundant features, then the most variable of those
#[derive(Debug, Clone, PartialEq)]
pub struct HighAbundanceAndVarianceSelector {
    pub use_log: bool,
    pub min_features: usize,
    pub min_features_rate: f64,
    pub max_components: usize,
}

impl Default for HighAbundanceAndVarianceSelector {
    fn default() -> Self {
        Self {
            use_log: false,
            min_features: 1,
            min_features_rate: 0.0,
            max_components: 10,
        }
    }
}

impl HighAbundanceAndVarianceSelector {
    #[must_use]
    pub fn with_use_log(mut self, use_log: bool) -> Self {
        self.use_log = use_log;
        self
    }

    #[must_use]
    pub fn with_min_features(mut self, min_features: usize, min_features_rate: f64) -> Self {
        self.min_features = min_features;
        self.min_features_rate = min_features_rate;
        self
    }

    #[must_use]
    pub fn with_max_components(mut self, max_components: usize) -> Self {
        self.max_components = max_components;
        self
    }
}

impl FeatureSelector for HighAbundanceAndVarianceSelector {
    fn fit(&self, data: ArrayView2<f64>) -> Result<Array1<bool>> {
        validate_rate(self.min_features_rate, "min_features_rate", "abundance/variance selector")?;
        let n_features = data.ncols();
        let required =
            (self.min_features as f64).max(self.min_features_rate * n_features as f64);
        if required >= n_features as f64 {
            return Ok(Array1::from_elem(n_features, true));
        }

        let abundance = GmmSelector {
            use_log: self.use_log,
            n_candidates: Some(1),
            min_features: self.min_features,
            min_features_rate: self.min_features_rate,
            max_components: self.max_components,
            ..GmmSelector::new(Characteristic::Mean)
        };
        let mut selected = abundance.fit(data)?;
        let kept = count(&selected);
        let filtered = data.select(Axis(1), &selected_indices(&selected));

        let variance = GmmSelector {
            use_log: self.use_log,
            n_candidates: None,
            min_features: self.min_features,
            min_features_rate: (self.min_features_rate * n_features as f64 / kept.max(1) as f64)
                .min(1.0),
            max_components: self.max_components,
            ..GmmSelector::new(Characteristic::Variance)
        };
        let variable = variance.fit(filtered.view())?;
        refine(&mut selected, &variable);
        debug!(abundant = kept, selected = count(&selected), n_features, "gmm feature filter");
        Ok(selected)
    }
}

/// Outlier-based composite: drops low-abundance outliers, then keeps
/// high-variance outliers, with percentage fallbacks when a stage is
/// degenerate.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierAbundanceAndVarianceSelector {
    pub use_log: bool,
    pub min_features_rate: f64,
    /// Fraction of features the variance stage aims to keep
    pub p: f64,
}

impl Default for OutlierAbundanceAndVarianceSelector {
    fn default() -> Self {
        Self {
            use_log: false,
            min_features_rate: 0.01,
            p: 0.2,
        }
    }
}

impl OutlierAbundanceAndVarianceSelector {
    #[must_use]
    pub fn with_use_log(mut self, use_log: bool) -> Self {
        self.use_log = use_log;
        self
    }

    #[must_use]
    pub fn with_min_features_rate(mut self, min_features_rate: f64) -> Self {
        self.min_features_rate = min_features_rate;
        self
    }

    #[must_use]
    pub fn with_p(mut self, p: f64) -> Self {
        self.p = p;
        self
    }

    fn degenerate(fraction: f64, min_rate: f64) -> bool {
        fraction < min_rate || fraction >= 1.0 - EPS
    }
}

impl FeatureSelector for OutlierAbundanceAndVarianceSelector {
    fn fit(&self, data: ArrayView2<f64>) -> Result<Array1<bool>> {
        validate_rate(self.min_features_rate, "min_features_rate", "outlier selector")?;
        validate_rate(self.p, "p", "outlier selector")?;
        let n_features = data.ncols();
        if self.min_features_rate >= 1.0 || n_features == 0 {
            return Ok(Array1::from_elem(n_features, true));
        }

        let mut selected = OutlierSelector {
            stat: Characteristic::Mean,
            use_log: self.use_log,
            side: OutlierSide::Low,
            keep_outliers: false,
        }
        .fit(data)?;
        let mut fraction = count(&selected) as f64 / n_features as f64;
        if Self::degenerate(fraction, self.min_features_rate) {
            selected = PercentageSelector {
                stat: Characteristic::Mean,
                use_log: self.use_log,
                keep_top: true,
                p: 1.0 - self.p,
            }
            .fit(data)?;
            fraction = count(&selected) as f64 / n_features as f64;
        }

        let filtered = data.select(Axis(1), &selected_indices(&selected));
        let corrected_rate = (self.min_features_rate / fraction).min(1.0);
        let mut variable = OutlierSelector {
            stat: Characteristic::Variance,
            use_log: self.use_log,
            side: OutlierSide::High,
            keep_outliers: true,
        }
        .fit(filtered.view())?;
        let variable_fraction = count(&variable) as f64 / filtered.ncols().max(1) as f64;
        if Self::degenerate(variable_fraction, corrected_rate) {
            variable = PercentageSelector {
                stat: Characteristic::Variance,
                use_log: self.use_log,
                keep_top: true,
                p: (self.p / fraction).min(1.0),
            }
            .fit(filtered.view())?;
        }
        refine(&mut selected, &variable);
        debug!(selected = count(&selected), n_features, "outlier feature filter");
        Ok(selected)
    }
}

/// Feature filtering applied at every node of the tree
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FeatureFilter {
    /// Keep every feature
    #[default]
    None,
    Gmm(HighAbundanceAndVarianceSelector),
    Outlier(OutlierAbundanceAndVarianceSelector),
}

impl FeatureFilter {
    /// GMM thresholds need many features to be stable; fall back to outliers otherwise.
    pub fn auto(n_features: usize) -> Self {
        if n_features > 250 {
            FeatureFilter::Gmm(HighAbundanceAndVarianceSelector::default())
        } else {
            FeatureFilter::Outlier(OutlierAbundanceAndVarianceSelector::default())
        }
    }
}

impl FeatureSelector for FeatureFilter {
    fn fit(&self, data: ArrayView2<f64>) -> Result<Array1<bool>> {
        match self {
            FeatureFilter::None => Ok(Array1::from_elem(data.ncols(), true)),
            FeatureFilter::Gmm(selector) => selector.fit(data),
            FeatureFilter::Outlier(selector) => selector.fit(data),
        }
    }
}
