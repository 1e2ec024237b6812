//! # Per-Row Model Solver
//!
//! [`ModelSolver`] is the boundary between the partitioning engine and the
//! numerical fitting machinery. The engine only ever asks "fit this response
//! against this design" and reads back a [`FitResult`]; how a likelihood is
//! maximised is the solver's business.
//!
//! [`LinearMixedSolver`] is the built-in implementation:
//!
//! 1.  **Weights:** observation weight `w_i` means residual variance `σ²/w_i`.
//!     Rows of the response and of every design block are scaled by `sqrt(w_i)`,
//!     after which the residual is homoscedastic.
//! 2.  **Fixed models:** least squares on nested prefixes of the design gives
//!     the sequential (type I) sums of squares in formula order.
//! 3.  **Mixed models:** random intercepts per grouping variable. Variance
//!     components are estimated by EM iterations for ML (default) or REML,
//!     fixed effects by GLS. Components whose likelihood gradient is
//!     non-positive at zero are moved onto the boundary, so singular fits are
//!     reported exactly instead of creeping towards zero.

use crate::model::design::{Grouping, ModelDesign, TermLayout};
use crate::model::fit::{
    Coefficients, EffectsKind, FitDiagnostics, FitResult, FixedFit, MixedFit, TermContribution,
};
use crate::model::formula::TermKind;
use crate::model::linalg::{Cholesky, LinalgError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Optimizer configuration handed to the solver with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverControl {
    pub max_iterations: usize,
    /// Converged once both the relative change in log-likelihood and the
    /// largest component step, relative to the total variance, fall below this.
    pub tolerance: f64,
    /// `sqrt(σ²_term / σ²_residual)` below which a component is on the boundary.
    pub boundary_tolerance: f64,
}

impl Default for SolverControl {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-8,
            boundary_tolerance: 1e-4,
        }
    }
}

/// Everything a solver needs for one row.
#[derive(Debug, Clone, Copy)]
pub struct FitRequest<'a> {
    pub design: &'a ModelDesign,
    pub response: ArrayView1<'a, f64>,
    pub weights: Option<ArrayView1<'a, f64>>,
    pub kind: EffectsKind,
    pub reml: bool,
    pub control: &'a SolverControl,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("The formula has no random effects, so there is no mixed model to fit.")]
    NoRandomEffects,
    #[error("A fixed-effect fit was requested for a formula with random effects.")]
    UnexpectedRandomEffects,
    #[error(
        "The fixed-effect design matrix is rank deficient: {rank} estimable directions for {columns} columns and {samples} samples."
    )]
    RankDeficient {
        rank: usize,
        columns: usize,
        samples: usize,
    },
    #[error("The response has {found} values, but the design has {expected} samples.")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Observation weights must be finite and positive; found {0}.")]
    InvalidWeight(f64),
    #[error("Numerical failure while fitting: {0}")]
    Numerical(String),
}

impl From<LinalgError> for SolverError {
    fn from(err: LinalgError) -> Self {
        SolverError::Numerical(err.to_string())
    }
}

/// The model-fitting capability consumed by the orchestrator.
///
/// Implementations must be shareable across worker threads; every call is
/// independent and must not mutate shared state.
pub trait ModelSolver: Sync {
    fn fit(&self, request: &FitRequest<'_>) -> Result<FitResult, SolverError>;
}

/// Weighted least squares for fixed models, EM-based ML/REML for random intercepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearMixedSolver;

impl ModelSolver for LinearMixedSolver {
    fn fit(&self, request: &FitRequest<'_>) -> Result<FitResult, SolverError> {
        let design = request.design;
        match request.kind {
            EffectsKind::Mixed if !design.has_random_terms() => {
                return Err(SolverError::NoRandomEffects);
            }
            EffectsKind::Fixed if design.has_random_terms() => {
                return Err(SolverError::UnexpectedRandomEffects);
            }
            _ => {}
        }
        if design.is_rank_deficient() {
            return Err(SolverError::RankDeficient {
                rank: design.rank(),
                columns: design.n_fixed_columns(),
                samples: design.n_samples(),
            });
        }

        let problem = ScaledProblem::new(design, request.response, request.weights)?;
        match request.kind {
            EffectsKind::Fixed => fit_fixed(design, &problem).map(FitResult::Fixed),
            EffectsKind::Mixed => {
                fit_mixed(design, &problem, request.reml, request.control).map(FitResult::Mixed)
            }
        }
    }
}

/// Response and fixed design after scaling rows by `sqrt(w)`.
struct ScaledProblem {
    root_weights: Array1<f64>,
    y: Array1<f64>,
    x: Array2<f64>,
    log_weight_sum: f64,
}

impl ScaledProblem {
    fn new(
        design: &ModelDesign,
        response: ArrayView1<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<Self, SolverError> {
        let n = design.n_samples();
        if response.len() != n {
            return Err(SolverError::LengthMismatch {
                expected: n,
                found: response.len(),
            });
        }
        let root_weights = match weights {
            Some(w) => {
                if w.len() != n {
                    return Err(SolverError::LengthMismatch {
                        expected: n,
                        found: w.len(),
                    });
                }
                if let Some(&bad) = w.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
                    return Err(SolverError::InvalidWeight(bad));
                }
                w.mapv(f64::sqrt)
            }
            None => Array1::ones(n),
        };
        let y = &response * &root_weights;
        let x = &design.x() * &root_weights.view().insert_axis(Axis(1));
        let log_weight_sum = root_weights.iter().map(|r| 2.0 * r.ln()).sum();
        Ok(Self {
            root_weights,
            y,
            x,
            log_weight_sum,
        })
    }

    fn n(&self) -> usize {
        self.y.len()
    }
}

struct LeastSquares {
    beta: Array1<f64>,
    rss: f64,
    xtx_inverse: Array2<f64>,
}

fn least_squares(x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<LeastSquares, SolverError> {
    let xtx = x.t().dot(&x);
    let factor = xtx.cholesky()?;
    let beta = factor.solve_vec(&x.t().dot(&y));
    let residual = &y - &x.dot(&beta);
    Ok(LeastSquares {
        rss: residual.dot(&residual),
        xtx_inverse: factor.inverse(),
        beta,
    })
}

fn residual_sum_of_squares(x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<f64, SolverError> {
    let xtx = x.t().dot(&x);
    let factor = xtx.cholesky()?;
    let beta = factor.solve_vec(&x.t().dot(&y));
    let residual = &y - &x.dot(&beta);
    Ok(residual.dot(&residual))
}

fn fit_fixed(design: &ModelDesign, problem: &ScaledProblem) -> Result<FixedFit, SolverError> {
    let n = problem.n();
    let p = design.n_fixed_columns();
    let full = least_squares(problem.x.view(), problem.y.view())?;

    // Intercept-only model: total sum of squares about the weighted mean.
    let mut previous_rss = residual_sum_of_squares(problem.x.slice(s![.., ..1]), problem.y.view())?;
    let mut sums_of_squares = Vec::with_capacity(design.terms().len());
    for term in design.terms() {
        let TermLayout::Fixed { name, columns } = term else {
            return Err(SolverError::UnexpectedRandomEffects);
        };
        let rss = if columns.is_empty() {
            previous_rss
        } else if columns.end == p {
            full.rss
        } else {
            residual_sum_of_squares(problem.x.slice(s![.., ..columns.end]), problem.y.view())?
        };
        sums_of_squares.push(TermContribution {
            term: name.clone(),
            kind: TermKind::Fixed,
            value: previous_rss - rss,
        });
        previous_rss = rss;
    }

    let df_residual = (n - p) as f64;
    let residual_variance = full.rss / df_residual;
    let nf = n as f64;
    let log_likelihood =
        -0.5 * nf * ((2.0 * PI * full.rss / nf).ln() + 1.0) + 0.5 * problem.log_weight_sum;

    Ok(FixedFit {
        coefficients: Coefficients {
            names: design.coefficient_names().to_vec(),
            covariance: full.xtx_inverse * residual_variance,
            estimates: full.beta.clone(),
        },
        sums_of_squares,
        residual_ss: full.rss,
        residual_variance,
        df_residual,
        fitted: design.x().dot(&full.beta),
        diagnostics: FitDiagnostics::exact(log_likelihood),
    })
}

/// Quantities of a mixed model evaluated at fixed variance components.
struct MixedState {
    beta: Array1<f64>,
    /// `V⁻¹(y - Xβ)` on the scaled problem.
    projected_residual: Array1<f64>,
    /// `V⁻¹` for ML, `P = V⁻¹ - V⁻¹X(XᵀV⁻¹X)⁻¹XᵀV⁻¹` for REML.
    trace_operator: Array2<f64>,
    beta_covariance: Array2<f64>,
    log_likelihood: f64,
}

/// Variance components: one per grouping, plus the residual.
#[derive(Clone, Debug, PartialEq)]
struct Components {
    groups: Vec<f64>,
    residual: f64,
}

fn marginal_covariance(problem: &ScaledProblem, groupings: &[Grouping], theta: &Components) -> Array2<f64> {
    let n = problem.n();
    let r = &problem.root_weights;
    let mut v = Array2::from_diag_elem(n, theta.residual);
    for (grouping, &sigma2) in groupings.iter().zip(&theta.groups) {
        if sigma2 == 0.0 {
            continue;
        }
        for members in &grouping.members {
            for &i in members {
                for &j in members {
                    v[(i, j)] += sigma2 * r[i] * r[j];
                }
            }
        }
    }
    v
}

fn evaluate(
    problem: &ScaledProblem,
    groupings: &[Grouping],
    theta: &Components,
    reml: bool,
) -> Result<MixedState, SolverError> {
    let n = problem.n() as f64;
    let p = problem.x.ncols() as f64;
    let v = marginal_covariance(problem, groupings, theta);
    let v_factor = v.cholesky()?;
    let v_inverse = v_factor.inverse();
    let v_inverse_x = v_inverse.dot(&problem.x);
    let xtvx = problem.x.t().dot(&v_inverse_x);
    let xtvx_factor = xtvx.cholesky()?;
    let beta = xtvx_factor.solve_vec(&v_inverse_x.t().dot(&problem.y));
    let residual = &problem.y - &problem.x.dot(&beta);
    let projected_residual = v_inverse.dot(&residual);
    let quadratic = residual.dot(&projected_residual);
    let beta_covariance = xtvx_factor.inverse();

    let (log_likelihood, trace_operator) = if reml {
        let ll = -0.5
            * ((n - p) * (2.0 * PI).ln()
                + v_factor.log_determinant()
                + xtvx_factor.log_determinant()
                + quadratic);
        let correction = v_inverse_x.dot(&beta_covariance).dot(&v_inverse_x.t());
        (ll, v_inverse - correction)
    } else {
        let ll = -0.5 * (n * (2.0 * PI).ln() + v_factor.log_determinant() + quadratic);
        (ll, v_inverse)
    };

    Ok(MixedState {
        beta,
        projected_residual,
        trace_operator,
        beta_covariance,
        log_likelihood,
    })
}

/// `(rᵀZZᵀr, tr(ZᵀMZ))` for one scaled grouping design `Z`.
fn grouping_score_and_trace(problem: &ScaledProblem, grouping: &Grouping, state: &MixedState) -> (f64, f64) {
    let w = &problem.root_weights;
    let r = &state.projected_residual;
    let m = &state.trace_operator;
    let mut score = 0.0;
    let mut trace = 0.0;
    for members in &grouping.members {
        let level_sum: f64 = members.iter().map(|&i| w[i] * r[i]).sum();
        score += level_sum * level_sum;
        for &i in members {
            for &j in members {
                trace += w[i] * w[j] * m[(i, j)];
            }
        }
    }
    (score, trace)
}

fn em_step(problem: &ScaledProblem, groupings: &[Grouping], theta: &Components, state: &MixedState, floor: f64) -> Components {
    let groups = groupings
        .iter()
        .zip(&theta.groups)
        .map(|(grouping, &sigma2)| {
            if sigma2 == 0.0 {
                return 0.0;
            }
            let (score, trace) = grouping_score_and_trace(problem, grouping, state);
            let q = grouping.n_levels() as f64;
            (sigma2 + sigma2 * sigma2 * (score - trace) / q).max(0.0)
        })
        .collect();

    let n = problem.n() as f64;
    let r = &state.projected_residual;
    let trace = state.trace_operator.diag().sum();
    let residual = theta.residual + theta.residual * theta.residual * (r.dot(r) - trace) / n;
    Components {
        groups,
        residual: residual.max(floor),
    }
}

struct EmOutcome {
    theta: Components,
    state: MixedState,
    iterations: usize,
    converged: bool,
}

fn run_em(
    problem: &ScaledProblem,
    groupings: &[Grouping],
    start: Components,
    reml: bool,
    control: &SolverControl,
    budget: usize,
    floor: f64,
) -> Result<EmOutcome, SolverError> {
    let mut theta = start;
    let mut state = evaluate(problem, groupings, &theta, reml)?;
    let mut iterations = 0;
    let mut converged = false;
    while iterations < budget {
        iterations += 1;
        let next = em_step(problem, groupings, &theta, &state, floor);
        let next_state = evaluate(problem, groupings, &next, reml)?;
        let change = (next_state.log_likelihood - state.log_likelihood).abs();
        let step = relative_step(&theta, &next);
        theta = next;
        state = next_state;
        if change <= control.tolerance * (state.log_likelihood.abs() + 1.0) && step <= control.tolerance {
            converged = true;
            break;
        }
    }
    Ok(EmOutcome {
        theta,
        state,
        iterations,
        converged,
    })
}

/// Largest absolute change of any component, as a share of the new total variance.
fn relative_step(old: &Components, new: &Components) -> f64 {
    let total = new.residual + new.groups.iter().sum::<f64>();
    let largest = old
        .groups
        .iter()
        .zip(&new.groups)
        .map(|(a, b)| (a - b).abs())
        .fold((old.residual - new.residual).abs(), f64::max);
    largest / total
}

/// Moves each component whose likelihood gradient at zero is non-positive onto
/// the boundary. Returns whether anything moved.
fn settle_boundary(
    problem: &ScaledProblem,
    groupings: &[Grouping],
    outcome: &mut EmOutcome,
    reml: bool,
) -> Result<bool, SolverError> {
    let mut moved = false;
    for k in 0..groupings.len() {
        if outcome.theta.groups[k] == 0.0 {
            continue;
        }
        let mut trial = outcome.theta.clone();
        trial.groups[k] = 0.0;
        let trial_state = evaluate(problem, groupings, &trial, reml)?;
        let (score, trace) = grouping_score_and_trace(problem, &groupings[k], &trial_state);
        let slack = 1e-9 * (outcome.state.log_likelihood.abs() + 1.0);
        if score - trace <= 0.0 && trial_state.log_likelihood >= outcome.state.log_likelihood - slack {
            outcome.theta = trial;
            outcome.state = trial_state;
            moved = true;
        }
    }
    Ok(moved)
}

fn sample_variance(values: &Array1<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.sum() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}

fn fit_mixed(
    design: &ModelDesign,
    problem: &ScaledProblem,
    reml: bool,
    control: &SolverControl,
) -> Result<MixedFit, SolverError> {
    let n = problem.n();
    let p = design.n_fixed_columns();
    let groupings = design.groupings();

    let ols = least_squares(problem.x.view(), problem.y.view())?;
    let start_variance = (ols.rss / (n - p) as f64).max(f64::MIN_POSITIVE);
    let share = start_variance / (groupings.len() + 1) as f64;
    let floor = start_variance * 1e-12;
    let start = Components {
        groups: vec![share; groupings.len()],
        residual: share,
    };

    let mut outcome = run_em(problem, groupings, start, reml, control, control.max_iterations, floor)?;
    let mut iterations = outcome.iterations;
    if settle_boundary(problem, groupings, &mut outcome, reml)? {
        let refined = run_em(problem, groupings, outcome.theta.clone(), reml, control, control.max_iterations, floor)?;
        iterations += refined.iterations;
        outcome = refined;
    }
    if !outcome.converged {
        log::debug!(
            "Variance component iterations stopped at the limit of {} without converging.",
            control.max_iterations
        );
    }

    let EmOutcome { theta, state, converged, .. } = outcome;
    let x = design.x();
    let mut components = Vec::with_capacity(design.terms().len());
    let mut singular_terms = Vec::new();
    for term in design.terms() {
        match term {
            TermLayout::Fixed { name, columns } => {
                let part = x
                    .slice(s![.., columns.clone()])
                    .dot(&state.beta.slice(s![columns.clone()]));
                components.push(TermContribution {
                    term: name.clone(),
                    kind: TermKind::Fixed,
                    value: sample_variance(&part),
                });
            }
            TermLayout::Random { name, grouping } => {
                let sigma2 = theta.groups[*grouping];
                if (sigma2 / theta.residual).sqrt() < control.boundary_tolerance {
                    singular_terms.push(name.clone());
                }
                components.push(TermContribution {
                    term: name.clone(),
                    kind: TermKind::Random,
                    value: sigma2,
                });
            }
        }
    }

    // Conditional fitted values: Xβ plus the BLUPs of every grouping.
    let mut fitted = x.dot(&state.beta);
    for (grouping, &sigma2) in groupings.iter().zip(&theta.groups) {
        for members in &grouping.members {
            let blup = sigma2
                * members
                    .iter()
                    .map(|&i| problem.root_weights[i] * state.projected_residual[i])
                    .sum::<f64>();
            for &i in members {
                fitted[i] += blup;
            }
        }
    }

    Ok(MixedFit {
        coefficients: Coefficients {
            names: design.coefficient_names().to_vec(),
            estimates: state.beta,
            covariance: state.beta_covariance,
        },
        components,
        residual_variance: theta.residual,
        df_residual: (n - p) as f64,
        fitted,
        reml,
        diagnostics: FitDiagnostics {
            converged,
            convergence_code: if converged { 0 } else { 1 },
            iterations,
            log_likelihood: state.log_likelihood,
            singular_terms,
        },
    })
}
