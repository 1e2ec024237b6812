//! Precision weights from a first round of per-row fits.
//!
//! Each fitted row contributes one point `(mean fitted value, sqrt(residual sd))`
//! to a mean-variance trend. Every observation is then weighted by the inverse
//! of the variance the trend predicts at its fitted value.

use crate::model::fit::FitResult;
use crate::types::FitCollection;
use ndarray::Array2;
use thiserror::Error;

/// The fitted mean-variance curve: predicted `sqrt(residual sd)` at a mean.
pub type TrendCurve = Box<dyn Fn(f64) -> f64 + Send + Sync>;

/// Smoother for the mean-variance relationship (lowess or similar).
pub trait MeanVarianceTrend {
    fn fit_trend(&self, means: &[f64], spreads: &[f64]) -> TrendCurve;
}

#[derive(Error, Debug, PartialEq)]
pub enum WeightsError {
    #[error("The mean-variance trend predicted {value} at fitted value {at} of row {row}; predictions must be finite and positive.")]
    InvalidPrediction { row: usize, at: f64, value: f64 },
    #[error("Row {row} has {found} fitted values, but the collection has {expected} samples.")]
    ShapeMismatch { row: usize, expected: usize, found: usize },
}

/// Observation weights for every row of `fits`, one per sample.
///
/// Falls back to weight 1 for every observation when fewer than two rows have
/// positive residual degrees of freedom. Rows whose fit failed also get weight 1.
pub fn precision_weights(
    fits: &FitCollection<FitResult>,
    trend: &dyn MeanVarianceTrend,
) -> Result<Array2<f64>, WeightsError> {
    let mut weights = Array2::ones((fits.len(), fits.n_samples));

    let mut means = Vec::new();
    let mut spreads = Vec::new();
    for (row, fit) in fits.results.iter().enumerate() {
        let Ok(fit) = fit else { continue };
        if fit.df_residual() <= 0.0 {
            continue;
        }
        let fitted = fit.fitted();
        if fitted.len() != fits.n_samples {
            return Err(WeightsError::ShapeMismatch {
                row,
                expected: fits.n_samples,
                found: fitted.len(),
            });
        }
        means.push(fitted.mean().unwrap_or_default());
        spreads.push(fit.residual_variance().sqrt().sqrt());
    }

    if means.len() < 2 {
        log::warn!(
            "Fewer than two rows have residual degrees of freedom, so no mean-variance trend can be estimated. Every observation gets weight 1."
        );
        return Ok(weights);
    }

    let curve = trend.fit_trend(&means, &spreads);
    for (row, fit) in fits.results.iter().enumerate() {
        let Ok(fit) = fit else {
            log::debug!("Row {row} has no fit; its observations keep weight 1.");
            continue;
        };
        for (sample, &at) in fit.fitted().iter().enumerate() {
            let value = curve(at);
            if !(value.is_finite() && value > 0.0) {
                return Err(WeightsError::InvalidPrediction { row, at, value });
            }
            weights[(row, sample)] = value.powi(4).recip();
        }
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fit::{Coefficients, EffectsKind, FitDiagnostics, FixedFit};
    use crate::types::RowFitFailure;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    /// Straight-line trend through the first and last points.
    struct Chord;

    impl MeanVarianceTrend for Chord {
        fn fit_trend(&self, means: &[f64], spreads: &[f64]) -> TrendCurve {
            let (x0, y0) = (means[0], spreads[0]);
            let (x1, y1) = (means[means.len() - 1], spreads[spreads.len() - 1]);
            let slope = (y1 - y0) / (x1 - x0);
            Box::new(move |x| y0 + slope * (x - x0))
        }
    }

    fn fit(level: f64, residual_variance: f64) -> FitResult {
        FitResult::Fixed(FixedFit {
            coefficients: Coefficients {
                names: vec!["(Intercept)".to_string()],
                estimates: Array1::from_elem(1, level),
                covariance: Array2::eye(1),
            },
            sums_of_squares: Vec::new(),
            residual_ss: residual_variance * 3.0,
            residual_variance,
            df_residual: 3.0,
            fitted: Array1::from_elem(4, level),
            diagnostics: FitDiagnostics::exact(0.0),
        })
    }

    fn collection(results: Vec<Result<FitResult, RowFitFailure>>) -> FitCollection<FitResult> {
        FitCollection {
            row_ids: (0..results.len()).map(|i| format!("g{i}")).collect(),
            n_samples: 4,
            method: EffectsKind::Fixed,
            results,
        }
    }

    #[test]
    fn weights_are_inverse_predicted_variance() {
        // sqrt(sd) is 1 at mean 0 and 2 at mean 10.
        let fits = collection(vec![Ok(fit(0.0, 1.0)), Ok(fit(5.0, 4.0)), Ok(fit(10.0, 16.0))]);
        let weights = precision_weights(&fits, &Chord).unwrap();
        assert_abs_diff_eq!(weights[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[(1, 1)], 1.0 / 1.5_f64.powi(4), epsilon = 1e-12);
        assert_abs_diff_eq!(weights[(2, 3)], 1.0 / 16.0, epsilon = 1e-12);
    }

    #[test]
    fn without_replication_every_weight_is_one() {
        let failure = RowFitFailure {
            row: 1,
            id: "g1".to_string(),
            reason: "did not converge".to_string(),
        };
        let fits = collection(vec![Ok(fit(3.0, 2.0)), Err(failure)]);
        let weights = precision_weights(&fits, &Chord).unwrap();
        assert_eq!(weights.dim(), (2, 4));
        assert!(weights.iter().all(|&w| w == 1.0));
    }
}
