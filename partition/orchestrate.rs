//! Per-row model fitting.
//!
//! The design is built once per run; a row only contributes its response and
//! weights to a [`FitRequest`]. Whether the run fits fixed or mixed models is
//! decided once, from the first row, and reused for every other row.

use crate::chunk::Chunk;
use crate::model::design::ModelDesign;
use crate::model::fit::{EffectsKind, FitResult};
use crate::model::solver::{FitRequest, ModelSolver, SolverControl, SolverError};
use crate::run::PartitionError;
use crate::types::{RowFitFailure, RowOutcome, RowUnit};
use crate::validate::{ModelStatusValidator, Validated};
use std::any::Any;
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

/// Run-wide fitting settings.
#[derive(Debug, Clone, Copy)]
pub struct FitSettings<'a> {
    pub reml: bool,
    pub control: &'a SolverControl,
    pub validator: ModelStatusValidator,
    pub show_warnings: bool,
}

pub struct ModelFitOrchestrator<'a, S: ModelSolver + ?Sized> {
    design: &'a ModelDesign,
    solver: &'a S,
    settings: FitSettings<'a>,
    kind: EffectsKind,
    probe_elapsed: Duration,
}

impl<'a, S: ModelSolver + ?Sized> ModelFitOrchestrator<'a, S> {
    /// Fits `first` with the mixed-model machinery to learn which model family
    /// the formula needs.
    ///
    /// A "no random effects" answer selects fixed-effect fitting. A rank
    /// deficient design aborts the run: the design is the same for every row.
    pub fn probe(
        design: &'a ModelDesign,
        solver: &'a S,
        settings: FitSettings<'a>,
        first: &RowUnit<'_>,
    ) -> Result<Self, PartitionError> {
        let start = Instant::now();
        let kind = match solver.fit(&request(design, &settings, first, EffectsKind::Mixed)) {
            Ok(_) => EffectsKind::Mixed,
            Err(SolverError::NoRandomEffects) => {
                match solver.fit(&request(design, &settings, first, EffectsKind::Fixed)) {
                    Ok(_) => EffectsKind::Fixed,
                    Err(err) => fallback_kind(design, first, err)?,
                }
            }
            Err(err) => fallback_kind(design, first, err)?,
        };
        let probe_elapsed = start.elapsed();
        log::info!("Selected {kind} effects fitting from the probe fit of row '{}'.", first.id);
        if settings.reml && kind == EffectsKind::Mixed {
            log::warn!(
                "REML estimation is enabled. Fixed and random variance fractions are only comparable under maximum likelihood."
            );
        }
        Ok(Self {
            design,
            solver,
            settings,
            kind,
            probe_elapsed,
        })
    }

    pub fn kind(&self) -> EffectsKind {
        self.kind
    }

    /// Wall time of the probe fit(s) of the first row.
    pub fn probe_elapsed(&self) -> Duration {
        self.probe_elapsed
    }

    /// Fits and validates one row. A solver error, a solver panic, or a
    /// failing validation becomes a [`RowFitFailure`].
    pub fn fit_one(&self, unit: &RowUnit<'_>) -> RowOutcome<Validated<FitResult>> {
        let request = request(self.design, &self.settings, unit, self.kind);
        let fit = match catch_unwind(AssertUnwindSafe(|| self.solver.fit(&request))) {
            Ok(Ok(fit)) => fit,
            Ok(Err(err)) => return Err(RowFitFailure::new(unit, err.to_string())),
            Err(payload) => {
                return Err(RowFitFailure::new(
                    unit,
                    format!("the solver panicked: {}", panic_message(payload.as_ref())),
                ));
            }
        };

        let report = self.settings.validator.validate(&fit);
        if report.is_fail() {
            return Err(RowFitFailure::new(unit, report.messages.join(" ")));
        }
        if self.settings.show_warnings {
            for message in &report.messages {
                log::warn!("Row '{}': {message}", unit.id);
            }
        }
        Ok(Validated { value: fit, report })
    }

    /// Fits one row and applies `transform` to the validated fit.
    pub fn run_unit<T, E, F>(&self, unit: &RowUnit<'_>, transform: &F) -> RowOutcome<T>
    where
        E: Display,
        F: Fn(FitResult) -> Result<T, E>,
    {
        let validated = self.fit_one(unit)?;
        transform(validated.value).map_err(|err| RowFitFailure::new(unit, err.to_string()))
    }

    /// Runs every row of `chunk` in order, sequentially.
    pub fn run_chunk<T, E, F>(&self, chunk: Chunk<'_>, transform: &F) -> Vec<RowOutcome<T>>
    where
        E: Display,
        F: Fn(FitResult) -> Result<T, E>,
    {
        chunk.rows.map(|unit| self.run_unit(&unit, transform)).collect()
    }
}

fn request<'r>(
    design: &'r ModelDesign,
    settings: &FitSettings<'r>,
    unit: &'r RowUnit<'_>,
    kind: EffectsKind,
) -> FitRequest<'r> {
    FitRequest {
        design,
        response: unit.response.reborrow(),
        weights: unit.weights.map(|w| w.reborrow()),
        kind,
        reml: settings.reml,
        control: settings.control,
    }
}

/// Maps a probe failure onto a run-level decision. Structural problems abort;
/// a numerical failure of the first row only means the model family is read
/// off the formula instead, and that row fails again on its own later.
fn fallback_kind(design: &ModelDesign, first: &RowUnit<'_>, err: SolverError) -> Result<EffectsKind, PartitionError> {
    match err {
        SolverError::RankDeficient { rank, columns, samples } => {
            Err(PartitionError::DesignRankDeficient { rank, columns, samples })
        }
        SolverError::Numerical(message) => {
            let kind = if design.has_random_terms() {
                EffectsKind::Mixed
            } else {
                EffectsKind::Fixed
            };
            log::warn!(
                "Probe fit of row '{}' failed ({message}); using {kind} effects from the formula.",
                first.id
            );
            Ok(kind)
        }
        other => Err(PartitionError::Solver(other)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fit::{Coefficients, FitDiagnostics, FixedFit};
    use crate::model::formula::Formula;
    use crate::model::metadata::{Column, Metadata};
    use crate::model::solver::LinearMixedSolver;
    use ndarray::{Array1, Array2};

    fn metadata(n: usize) -> Metadata {
        Metadata::new((0..n).map(|i| format!("s{i}")).collect())
            .with_column("Age", Column::Numeric(Array1::from_iter((0..n).map(|i| i as f64))))
            .and_then(|m| {
                m.with_column(
                    "Batch",
                    Column::Categorical((0..n).map(|i| format!("b{}", i % 3)).collect()),
                )
            })
            .unwrap()
    }

    fn unit<'a>(id: &'a str, response: &'a Array1<f64>) -> RowUnit<'a> {
        RowUnit {
            index: 0,
            id,
            response: response.view(),
            weights: None,
        }
    }

    fn settings(control: &SolverControl) -> FitSettings<'_> {
        FitSettings {
            reml: false,
            control,
            validator: ModelStatusValidator::default(),
            show_warnings: true,
        }
    }

    #[test]
    fn probe_selects_fixed_without_random_terms() {
        let design = ModelDesign::build(&Formula::parse("~ Age + Batch").unwrap(), &metadata(12)).unwrap();
        let y = Array1::from_iter((0..12).map(|i| ((i * 5) % 7) as f64));
        let control = SolverControl::default();
        let orchestrator =
            ModelFitOrchestrator::probe(&design, &LinearMixedSolver, settings(&control), &unit("g0", &y)).unwrap();
        assert_eq!(orchestrator.kind(), EffectsKind::Fixed);
    }

    #[test]
    fn probe_selects_mixed_with_random_terms() {
        let design = ModelDesign::build(&Formula::parse("~ Age + (1|Batch)").unwrap(), &metadata(12)).unwrap();
        let y = Array1::from_iter((0..12).map(|i| ((i * 5) % 7) as f64 + (i % 3) as f64));
        let control = SolverControl::default();
        let orchestrator =
            ModelFitOrchestrator::probe(&design, &LinearMixedSolver, settings(&control), &unit("g0", &y)).unwrap();
        assert_eq!(orchestrator.kind(), EffectsKind::Mixed);
        let fit = orchestrator.fit_one(&unit("g0", &y)).unwrap();
        assert_eq!(fit.value.kind(), EffectsKind::Mixed);
    }

    #[test]
    fn rank_deficiency_aborts_the_probe() {
        let n = 6;
        let meta = Metadata::new((0..n).map(|i| format!("s{i}")).collect())
            .with_column("Sample", Column::Categorical((0..n).map(|i| format!("s{i}")).collect()))
            .unwrap();
        let design = ModelDesign::build(&Formula::parse("~ Sample").unwrap(), &meta).unwrap();
        let y = Array1::from_iter((0..n).map(|i| i as f64));
        let control = SolverControl::default();
        let result = ModelFitOrchestrator::probe(&design, &LinearMixedSolver, settings(&control), &unit("g0", &y));
        assert!(matches!(
            result,
            Err(PartitionError::DesignRankDeficient { columns: 6, samples: 6, .. })
        ));
    }

    struct PanickingSolver;

    impl ModelSolver for PanickingSolver {
        fn fit(&self, request: &FitRequest<'_>) -> Result<FitResult, SolverError> {
            if request.response[0] < 0.0 {
                panic!("negative first sample");
            }
            let p = request.design.n_fixed_columns();
            Ok(FitResult::Fixed(FixedFit {
                coefficients: Coefficients {
                    names: request.design.coefficient_names().to_vec(),
                    estimates: Array1::zeros(p),
                    covariance: Array2::eye(p),
                },
                sums_of_squares: Vec::new(),
                residual_ss: 1.0,
                residual_variance: 1.0,
                df_residual: 1.0,
                fitted: Array1::zeros(request.response.len()),
                diagnostics: FitDiagnostics::exact(0.0),
            }))
        }
    }

    /// Reports two slope estimates that move in lockstep.
    struct LockstepSolver;

    impl ModelSolver for LockstepSolver {
        fn fit(&self, request: &FitRequest<'_>) -> Result<FitResult, SolverError> {
            Ok(FitResult::Fixed(FixedFit {
                coefficients: Coefficients {
                    names: vec!["(Intercept)".to_string(), "Age".to_string(), "Dose".to_string()],
                    estimates: Array1::zeros(3),
                    covariance: ndarray::array![[1.0, 0.0, 0.0], [0.0, 2.0, 2.0], [0.0, 2.0, 2.0]],
                },
                sums_of_squares: Vec::new(),
                residual_ss: 1.0,
                residual_variance: 1.0,
                df_residual: 1.0,
                fitted: Array1::zeros(request.response.len()),
                diagnostics: FitDiagnostics::exact(0.0),
            }))
        }
    }

    #[test]
    fn failing_validation_becomes_a_row_failure_with_rescale_advice() {
        let design = ModelDesign::build(&Formula::parse("~ Age").unwrap(), &metadata(6)).unwrap();
        let y = Array1::from_iter((0..6).map(|i| i as f64));
        let control = SolverControl::default();
        let orchestrator =
            ModelFitOrchestrator::probe(&design, &LockstepSolver, settings(&control), &unit("g7", &y)).unwrap();

        let failure = orchestrator.fit_one(&unit("g7", &y)).unwrap_err();
        assert_eq!(failure.id, "g7");
        assert!(failure.reason.contains(crate::validate::RESCALE_HINT));
        let transformed: RowOutcome<usize> =
            orchestrator.run_unit(&unit("g7", &y), &|fit: FitResult| Ok::<_, String>(fit.contributions().len()));
        assert!(transformed.is_err());
    }

    #[test]
    fn solver_panics_become_row_failures() {
        let design = ModelDesign::build(&Formula::parse("~ Age").unwrap(), &metadata(6)).unwrap();
        let good = Array1::from_elem(6, 1.0);
        let bad = Array1::from_elem(6, -1.0);
        let control = SolverControl::default();
        let orchestrator =
            ModelFitOrchestrator::probe(&design, &PanickingSolver, settings(&control), &unit("ok", &good)).unwrap();
        assert_eq!(orchestrator.kind(), EffectsKind::Mixed);

        let failure = orchestrator.fit_one(&unit("broken", &bad)).unwrap_err();
        assert_eq!(failure.id, "broken");
        assert!(failure.reason.contains("negative first sample"));
        let transformed: RowOutcome<usize> =
            orchestrator.run_unit(&unit("ok", &good), &|fit: FitResult| Ok::<_, String>(fit.contributions().len()));
        assert_eq!(transformed, Ok(0));
    }
}
