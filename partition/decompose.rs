//! # Variance Decomposition
//!
//! Every term's contribution is divided by one shared denominator, so fixed
//! and random terms are directly comparable and the fractions of a row sum to
//! one. For fixed-effect fits the contributions are sequential sums of
//! squares plus the residual sum of squares; for mixed fits they are the
//! variance components, the variance of each fixed term's fitted component,
//! and the residual variance.
//!
//! ### Adjustment
//!
//! - `adjust_terms = S`: terms in `S` leave both the numerator pool and the
//!   denominator. The remaining terms and the residual are renormalized and
//!   sum to one among themselves.
//! - `adjust_all`: each term is reported as an intra-class correlation
//!   against the residual alone, `c_t / (c_t + c_residual)`. There is no
//!   `Residuals` column.
//!
//! Negative contributions are clipped to zero before any of this happens.

use crate::model::fit::FitResult;
use crate::types::{RESIDUALS, VarPartRow};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecomposeError {
    #[error("Cannot adjust for '{0}': it is not a term of the model.")]
    UnknownTerm(String),
    #[error("The contribution of '{0}' is not a finite number.")]
    NonFinite(String),
    #[error("The total variance of the fit is zero, so no fractions can be formed.")]
    ZeroTotal,
}

/// Which terms leave the denominator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Adjustment {
    pub terms: Vec<String>,
    pub all: bool,
}

impl Adjustment {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.all || !self.terms.is_empty()
    }

    /// Output columns for a model with `term_names` in formula order.
    pub fn columns(&self, term_names: &[String]) -> Vec<String> {
        if self.all {
            return term_names.to_vec();
        }
        term_names
            .iter()
            .filter(|t| !self.terms.contains(*t))
            .cloned()
            .chain(std::iter::once(RESIDUALS.to_string()))
            .collect()
    }

    /// The terms reported as adjusted for, in formula order.
    pub fn adjusted_for(&self, term_names: &[String]) -> Vec<String> {
        if self.all {
            return term_names.to_vec();
        }
        term_names
            .iter()
            .filter(|t| self.terms.contains(*t))
            .cloned()
            .collect()
    }

    /// Fails on the first adjustment term that is not among `term_names`.
    pub fn check(&self, term_names: &[String]) -> Result<(), DecomposeError> {
        match self.terms.iter().find(|t| !term_names.contains(*t)) {
            Some(unknown) => Err(DecomposeError::UnknownTerm(unknown.clone())),
            None => Ok(()),
        }
    }
}

/// Splits the outcome variance of one fit into per-term fractions.
pub fn decompose(fit: &FitResult, adjustment: &Adjustment) -> Result<VarPartRow, DecomposeError> {
    let mut clipped = Vec::new();
    let mut clip = |term: &str, raw: f64| -> Result<f64, DecomposeError> {
        if !raw.is_finite() {
            return Err(DecomposeError::NonFinite(term.to_string()));
        }
        if raw < 0.0 {
            clipped.push((term.to_string(), raw));
            return Ok(0.0);
        }
        Ok(raw)
    };

    let mut terms = Vec::with_capacity(fit.contributions().len());
    for contribution in fit.contributions() {
        let value = clip(&contribution.term, contribution.value)?;
        terms.push((contribution.term.clone(), value));
    }
    let residual = clip(RESIDUALS, fit.residual_contribution())?;

    let names: Vec<String> = terms.iter().map(|(name, _)| name.clone()).collect();
    adjustment.check(&names)?;

    let fractions = if adjustment.all {
        terms
            .into_iter()
            .map(|(name, value)| {
                let total = value + residual;
                if total > 0.0 {
                    Ok((name, value / total))
                } else {
                    Err(DecomposeError::ZeroTotal)
                }
            })
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let kept: Vec<(String, f64)> = terms
            .into_iter()
            .filter(|(name, _)| !adjustment.terms.contains(name))
            .chain(std::iter::once((RESIDUALS.to_string(), residual)))
            .collect();
        let total: f64 = kept.iter().map(|(_, value)| value).sum();
        if total <= 0.0 {
            return Err(DecomposeError::ZeroTotal);
        }
        kept.into_iter().map(|(name, value)| (name, value / total)).collect()
    };

    Ok(VarPartRow { fractions, clipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fit::{
        Coefficients, FitDiagnostics, FixedFit, MixedFit, TermContribution,
    };
    use crate::model::formula::TermKind;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    fn coefficients() -> Coefficients {
        Coefficients {
            names: vec!["(Intercept)".to_string()],
            estimates: Array1::zeros(1),
            covariance: Array2::eye(1),
        }
    }

    fn contribution(term: &str, kind: TermKind, value: f64) -> TermContribution {
        TermContribution {
            term: term.to_string(),
            kind,
            value,
        }
    }

    fn mixed(components: Vec<TermContribution>, residual: f64) -> FitResult {
        FitResult::Mixed(MixedFit {
            coefficients: coefficients(),
            components,
            residual_variance: residual,
            df_residual: 10.0,
            fitted: Array1::zeros(12),
            reml: false,
            diagnostics: FitDiagnostics::exact(0.0),
        })
    }

    fn fixed(sums: Vec<TermContribution>, residual_ss: f64) -> FitResult {
        FitResult::Fixed(FixedFit {
            coefficients: coefficients(),
            sums_of_squares: sums,
            residual_ss,
            residual_variance: residual_ss / 10.0,
            df_residual: 10.0,
            fitted: Array1::zeros(12),
            diagnostics: FitDiagnostics::exact(0.0),
        })
    }

    #[test]
    fn mixed_fractions_share_one_denominator() {
        let fit = mixed(
            vec![
                contribution("Age", TermKind::Fixed, 1.0),
                contribution("Individual", TermKind::Random, 3.0),
            ],
            4.0,
        );
        let row = decompose(&fit, &Adjustment::none()).unwrap();
        assert_abs_diff_eq!(row.get("Age").unwrap(), 0.125);
        assert_abs_diff_eq!(row.get("Individual").unwrap(), 0.375);
        assert_abs_diff_eq!(row.get(RESIDUALS).unwrap(), 0.5);
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn adjusting_removes_terms_from_numerator_and_denominator() {
        let fit = fixed(
            vec![
                contribution("Batch", TermKind::Fixed, 6.0),
                contribution("Tissue", TermKind::Fixed, 2.0),
            ],
            2.0,
        );
        let adjustment = Adjustment {
            terms: vec!["Batch".to_string()],
            all: false,
        };
        assert!(adjustment.is_active());
        assert!(!Adjustment::none().is_active());
        let row = decompose(&fit, &adjustment).unwrap();
        assert_eq!(row.get("Batch"), None);
        assert_abs_diff_eq!(row.get("Tissue").unwrap(), 0.5);
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        assert_eq!(adjustment.adjusted_for(&["Batch".into(), "Tissue".into()]), vec!["Batch"]);
    }

    #[test]
    fn adjust_all_reports_each_term_against_the_residual() {
        let fit = mixed(
            vec![
                contribution("Individual", TermKind::Random, 3.0),
                contribution("Tissue", TermKind::Random, 1.0),
            ],
            1.0,
        );
        let adjustment = Adjustment {
            terms: Vec::new(),
            all: true,
        };
        let row = decompose(&fit, &adjustment).unwrap();
        assert_abs_diff_eq!(row.get("Individual").unwrap(), 0.75);
        assert_abs_diff_eq!(row.get("Tissue").unwrap(), 0.5);
        assert_eq!(row.get(RESIDUALS), None);
        let names = ["Individual".to_string(), "Tissue".to_string()];
        assert_eq!(adjustment.columns(&names), names.to_vec());
    }

    #[test]
    fn negative_contributions_are_clipped_and_recorded() {
        let fit = fixed(
            vec![
                contribution("Batch", TermKind::Fixed, -0.5),
                contribution("Tissue", TermKind::Fixed, 1.0),
            ],
            3.0,
        );
        let row = decompose(&fit, &Adjustment::none()).unwrap();
        assert_eq!(row.get("Batch"), Some(0.0));
        assert_eq!(row.clipped, vec![("Batch".to_string(), -0.5)]);
        assert_abs_diff_eq!(row.get("Tissue").unwrap(), 0.25);
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn unknown_adjustment_and_empty_totals_are_errors() {
        let fit = fixed(vec![contribution("Batch", TermKind::Fixed, 0.0)], 0.0);
        assert_eq!(decompose(&fit, &Adjustment::none()), Err(DecomposeError::ZeroTotal));

        let adjustment = Adjustment {
            terms: vec!["Sex".to_string()],
            all: false,
        };
        let fit = fixed(vec![contribution("Batch", TermKind::Fixed, 1.0)], 1.0);
        assert_eq!(
            decompose(&fit, &adjustment),
            Err(DecomposeError::UnknownTerm("Sex".to_string()))
        );
    }
}
