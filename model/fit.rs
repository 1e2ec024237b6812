//! Per-row fitted models as returned by a [`ModelSolver`](crate::model::solver::ModelSolver).

use crate::model::formula::TermKind;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which model family a run fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectsKind {
    Fixed,
    Mixed,
}

impl fmt::Display for EffectsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectsKind::Fixed => f.write_str("fixed"),
            EffectsKind::Mixed => f.write_str("mixed"),
        }
    }
}

/// One term's share of the outcome variance, on the scale of its fit.
#[derive(Debug, Clone, PartialEq)]
pub struct TermContribution {
    pub term: String,
    pub kind: TermKind,
    pub value: f64,
}

/// Optimizer diagnostics. `convergence_code` is 0 on convergence and non-zero
/// when the iteration limit was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct FitDiagnostics {
    pub converged: bool,
    pub convergence_code: i32,
    pub iterations: usize,
    pub log_likelihood: f64,
    /// Random terms whose variance component sits on the zero boundary.
    pub singular_terms: Vec<String>,
}

impl FitDiagnostics {
    /// Diagnostics of a closed-form fit.
    pub fn exact(log_likelihood: f64) -> Self {
        Self {
            converged: true,
            convergence_code: 0,
            iterations: 1,
            log_likelihood,
            singular_terms: Vec::new(),
        }
    }
}

/// Coefficient estimates shared by both model families.
#[derive(Debug, Clone)]
pub struct Coefficients {
    pub names: Vec<String>,
    pub estimates: Array1<f64>,
    pub covariance: Array2<f64>,
}

/// Weighted least-squares fit with a sequential ANOVA decomposition.
#[derive(Debug, Clone)]
pub struct FixedFit {
    pub coefficients: Coefficients,
    /// Sequential sums of squares, one per formula term, in formula order.
    pub sums_of_squares: Vec<TermContribution>,
    pub residual_ss: f64,
    pub residual_variance: f64,
    pub df_residual: f64,
    pub fitted: Array1<f64>,
    pub diagnostics: FitDiagnostics,
}

/// Linear mixed model fit with random intercepts.
#[derive(Debug, Clone)]
pub struct MixedFit {
    pub coefficients: Coefficients,
    /// One entry per formula term in formula order: variance components for
    /// random terms, variance of the fitted component `X_t β_t` for fixed terms.
    pub components: Vec<TermContribution>,
    pub residual_variance: f64,
    pub df_residual: f64,
    pub fitted: Array1<f64>,
    pub reml: bool,
    pub diagnostics: FitDiagnostics,
}

impl MixedFit {
    pub fn variance_components(&self) -> impl Iterator<Item = &TermContribution> {
        self.components.iter().filter(|c| c.kind == TermKind::Random)
    }
}

/// A fitted per-row model.
#[derive(Debug, Clone)]
pub enum FitResult {
    Fixed(FixedFit),
    Mixed(MixedFit),
}

impl FitResult {
    pub fn kind(&self) -> EffectsKind {
        match self {
            FitResult::Fixed(_) => EffectsKind::Fixed,
            FitResult::Mixed(_) => EffectsKind::Mixed,
        }
    }

    /// Term contributions in formula order, residual excluded.
    pub fn contributions(&self) -> &[TermContribution] {
        match self {
            FitResult::Fixed(fit) => &fit.sums_of_squares,
            FitResult::Mixed(fit) => &fit.components,
        }
    }

    /// The residual's contribution on the same scale as [`Self::contributions`].
    pub fn residual_contribution(&self) -> f64 {
        match self {
            FitResult::Fixed(fit) => fit.residual_ss,
            FitResult::Mixed(fit) => fit.residual_variance,
        }
    }

    pub fn coefficients(&self) -> &Coefficients {
        match self {
            FitResult::Fixed(fit) => &fit.coefficients,
            FitResult::Mixed(fit) => &fit.coefficients,
        }
    }

    pub fn diagnostics(&self) -> &FitDiagnostics {
        match self {
            FitResult::Fixed(fit) => &fit.diagnostics,
            FitResult::Mixed(fit) => &fit.diagnostics,
        }
    }

    pub fn residual_variance(&self) -> f64 {
        match self {
            FitResult::Fixed(fit) => fit.residual_variance,
            FitResult::Mixed(fit) => fit.residual_variance,
        }
    }

    pub fn df_residual(&self) -> f64 {
        match self {
            FitResult::Fixed(fit) => fit.df_residual,
            FitResult::Mixed(fit) => fit.df_residual,
        }
    }

    pub fn fitted(&self) -> &Array1<f64> {
        match self {
            FitResult::Fixed(fit) => &fit.fitted,
            FitResult::Mixed(fit) => &fit.fitted,
        }
    }
}
