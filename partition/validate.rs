//! Degenerate-fit detection.
//!
//! Checks are independent of each other; a report collects every condition
//! that applies. Warnings let the fit through, failures turn the row into a
//! [`RowFitFailure`](crate::types::RowFitFailure).

use crate::model::fit::{Coefficients, FitResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Default correlation between coefficient estimates above which a fit is flagged.
pub const DEFAULT_COLINEARITY_CUTOFF: f64 = 0.999;

/// Correlations this close to one mean the design is numerically singular.
const DEGENERATE_CORRELATION: f64 = 1.0 - 1e-10;

pub const RESCALE_HINT: &str = "Rescaling continuous predictors (for example to zero mean and unit variance) \
     improves numerical conditioning without changing variance fractions or significance.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidationStatus {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConditionCode {
    /// A variance component sits on the zero boundary.
    SingularFit,
    NonConvergence,
    HighCollinearity,
    /// Collinearity so extreme the fixed effects are not estimable.
    DegenerateCollinearity,
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionCode::SingularFit => "singular fit",
            ConditionCode::NonConvergence => "non-convergence",
            ConditionCode::HighCollinearity => "high collinearity",
            ConditionCode::DegenerateCollinearity => "degenerate collinearity",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub reasons: BTreeSet<ConditionCode>,
    /// One human-readable message per condition, in the order checked.
    pub messages: Vec<String>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            status: ValidationStatus::Ok,
            reasons: BTreeSet::new(),
            messages: Vec::new(),
        }
    }

    fn flag(&mut self, code: ConditionCode, status: ValidationStatus, message: String) {
        self.status = self.status.max(status);
        self.reasons.insert(code);
        self.messages.push(message);
    }

    pub fn is_fail(&self) -> bool {
        self.status == ValidationStatus::Fail
    }
}

/// A fit together with the report of the validator that accepted it.
#[derive(Debug, Clone)]
pub struct Validated<T> {
    pub value: T,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusValidator {
    pub colinearity_cutoff: f64,
    /// Whether boundary variance components are reported at all.
    pub report_singular: bool,
}

impl Default for ModelStatusValidator {
    fn default() -> Self {
        Self {
            colinearity_cutoff: DEFAULT_COLINEARITY_CUTOFF,
            report_singular: true,
        }
    }
}

impl ModelStatusValidator {
    pub fn new(colinearity_cutoff: f64) -> Self {
        Self {
            colinearity_cutoff,
            ..Self::default()
        }
    }

    pub fn validate(&self, fit: &FitResult) -> ValidationReport {
        let mut report = ValidationReport::ok();
        let diagnostics = fit.diagnostics();

        if self.report_singular && !diagnostics.singular_terms.is_empty() {
            report.flag(
                ConditionCode::SingularFit,
                ValidationStatus::Warn,
                format!(
                    "Singular fit: variance of {} estimated at the boundary.",
                    diagnostics.singular_terms.join(", ")
                ),
            );
        }

        if diagnostics.convergence_code != 0 {
            report.flag(
                ConditionCode::NonConvergence,
                ValidationStatus::Warn,
                format!(
                    "Model failed to converge (code {}) after {} iterations.",
                    diagnostics.convergence_code, diagnostics.iterations
                ),
            );
        }

        match colinearity_score(fit.coefficients()) {
            CollinearityScore::Degenerate => report.flag(
                ConditionCode::DegenerateCollinearity,
                ValidationStatus::Fail,
                format!("Fixed effects are perfectly collinear, so the design matrix is rank deficient. {RESCALE_HINT}"),
            ),
            CollinearityScore::Correlation { value, first, second } if value > self.colinearity_cutoff => report.flag(
                ConditionCode::HighCollinearity,
                ValidationStatus::Warn,
                format!(
                    "Estimates of '{first}' and '{second}' are correlated at {value:.6}, above the cutoff of {}.",
                    self.colinearity_cutoff
                ),
            ),
            _ => {}
        }

        report
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollinearityScore {
    /// Fewer than two non-intercept coefficients.
    NotApplicable,
    Correlation {
        value: f64,
        first: String,
        second: String,
    },
    /// A coefficient variance is not positive and finite, or a correlation is
    /// indistinguishable from one.
    Degenerate,
}

/// The largest absolute correlation between two non-intercept coefficient
/// estimates, read off the coefficient covariance matrix.
pub fn colinearity_score(coefficients: &Coefficients) -> CollinearityScore {
    let cov = &coefficients.covariance;
    let p = cov.nrows();
    let start = usize::from(coefficients.names.first().is_some_and(|n| n == "(Intercept)"));
    if p < start + 2 {
        return CollinearityScore::NotApplicable;
    }
    if (0..p).any(|j| !(cov[(j, j)].is_finite() && cov[(j, j)] > 0.0)) {
        return CollinearityScore::Degenerate;
    }

    let mut best = (0.0_f64, start, start + 1);
    for i in start..p {
        for j in (i + 1)..p {
            let r = (cov[(i, j)] / (cov[(i, i)] * cov[(j, j)]).sqrt()).abs();
            if !r.is_finite() || r > DEGENERATE_CORRELATION {
                return CollinearityScore::Degenerate;
            }
            if r > best.0 {
                best = (r, i, j);
            }
        }
    }
    let name = |k: usize| coefficients.names.get(k).cloned().unwrap_or_else(|| format!("#{k}"));
    CollinearityScore::Correlation {
        value: best.0,
        first: name(best.1),
        second: name(best.2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fit::{FitDiagnostics, FixedFit};
    use ndarray::{Array1, Array2, array};

    fn fixed_fit(covariance: Array2<f64>, diagnostics: FitDiagnostics) -> FitResult {
        let p = covariance.nrows();
        let names = std::iter::once("(Intercept)".to_string())
            .chain((1..p).map(|i| format!("x{i}")))
            .collect();
        FitResult::Fixed(FixedFit {
            coefficients: Coefficients {
                names,
                estimates: Array1::zeros(p),
                covariance,
            },
            sums_of_squares: Vec::new(),
            residual_ss: 1.0,
            residual_variance: 1.0,
            df_residual: 10.0,
            fitted: Array1::zeros(12),
            diagnostics,
        })
    }

    #[test]
    fn clean_fit_is_ok() {
        let cov = array![[1.0, 0.3, 0.0], [0.3, 1.0, 0.2], [0.0, 0.2, 1.0]];
        let report = ModelStatusValidator::default().validate(&fixed_fit(cov, FitDiagnostics::exact(0.0)));
        assert_eq!(report.status, ValidationStatus::Ok);
        assert!(report.reasons.is_empty());
    }

    #[test]
    fn intercept_correlation_is_ignored() {
        let cov = array![[1.0, 0.99999], [0.99999, 1.0]];
        let report = ModelStatusValidator::default().validate(&fixed_fit(cov, FitDiagnostics::exact(0.0)));
        assert_eq!(report.status, ValidationStatus::Ok);
    }

    #[test]
    fn high_collinearity_warns_and_extreme_fails_with_hint() {
        let cov = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.9995], [0.0, 0.9995, 1.0]];
        let report = ModelStatusValidator::default().validate(&fixed_fit(cov, FitDiagnostics::exact(0.0)));
        assert_eq!(report.status, ValidationStatus::Warn);
        assert!(report.reasons.contains(&ConditionCode::HighCollinearity));
        assert!(report.messages[0].contains("'x1' and 'x2'"));

        let cov = array![[1.0, 0.0, 0.0], [0.0, 1.0, 1.0], [0.0, 1.0, 1.0]];
        let report = ModelStatusValidator::default().validate(&fixed_fit(cov, FitDiagnostics::exact(0.0)));
        assert!(report.is_fail());
        assert!(report.messages[0].contains("Rescaling"));
    }

    #[test]
    fn singular_and_unconverged_fits_warn() {
        let diagnostics = FitDiagnostics {
            converged: false,
            convergence_code: 1,
            iterations: 500,
            log_likelihood: -10.0,
            singular_terms: vec!["Batch".to_string()],
        };
        let cov = Array2::eye(2);
        let validator = ModelStatusValidator::default();
        let report = validator.validate(&fixed_fit(cov.clone(), diagnostics.clone()));
        assert_eq!(report.status, ValidationStatus::Warn);
        assert_eq!(
            report.reasons.iter().copied().collect::<Vec<_>>(),
            vec![ConditionCode::SingularFit, ConditionCode::NonConvergence]
        );

        let quiet = ModelStatusValidator {
            report_singular: false,
            ..validator
        };
        let report = quiet.validate(&fixed_fit(cov, diagnostics));
        assert_eq!(report.reasons.len(), 1);
    }
}
