// ========================================================================================
//
//                        Caller-facing runs, options and errors
//
// ========================================================================================

use crate::chunk::{Chunk, ChunkPlanner, DEFAULT_CHUNK_COUNT};
use crate::decompose::{Adjustment, decompose};
use crate::executor::{MergeError, ParallelReducer, WorkerPool};
use crate::inputs::{CoreInputs, InputError};
use crate::iter::RowWeightedIterator;
use crate::model::design::{DesignError, ModelDesign};
use crate::model::fit::{EffectsKind, FitResult};
use crate::model::formula::{Formula, FormulaError};
use crate::model::solver::{ModelSolver, SolverControl, SolverError};
use crate::orchestrate::{FitSettings, ModelFitOrchestrator};
use crate::progress::{CostProjection, ProgressBarObserver};
use crate::types::{FitCollection, VarPartRow, VarPartTable};
use crate::validate::{DEFAULT_COLINEARITY_CUTOFF, ModelStatusValidator, RESCALE_HINT};
use rayon::ThreadPoolBuildError;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Problems with the inputs or options, found before any fitting starts.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Shape mismatch in the {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
    #[error("The metadata has {found} samples, but the expression matrix has {expected} sample columns.")]
    MetadataRows { expected: usize, found: usize },
    #[error(
        "Sample '{expression}' in column {position} of the expression matrix does not match metadata sample '{metadata}'. Both must list samples in the same order."
    )]
    SampleMismatch {
        position: usize,
        expression: String,
        metadata: String,
    },
    #[error("Variable '{0}' named in the formula was not found in the metadata.")]
    VariableNotFound(String),
    #[error("Row {row} ('{id}') has zero variance across samples. Remove constant rows before fitting.")]
    ZeroVariance { row: usize, id: String },
    #[error("Row {row} ('{id}') contains non-finite values (NaN or Infinity).")]
    NonFinite { row: usize, id: String },
    #[error("Row {row} ('{id}') of the weights matrix has weights that are not finite and positive.")]
    InvalidWeights { row: usize, id: String },
    #[error("The chunk count must be at least 1.")]
    InvalidChunkCount,
    #[error("The colinearity cutoff must lie in (0, 1]; found {0}.")]
    InvalidColinearityCutoff(f64),
    #[error("Cannot adjust for '{0}': it is not a term of the formula.")]
    UnknownAdjustTerm(String),
    #[error("Invalid formula: {0}")]
    InvalidFormula(#[from] FormulaError),
    #[error("Invalid model design: {0}")]
    Design(DesignError),
}

impl From<DesignError> for ConfigurationError {
    fn from(err: DesignError) -> Self {
        match err {
            DesignError::VariableNotFound(name) => ConfigurationError::VariableNotFound(name),
            other => ConfigurationError::Design(other),
        }
    }
}

/// Run-level failures. Row-level failures never surface here; they are
/// recorded in the row's slot of the result.
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("The worker pool has been shut down. Create a new pool before starting a run.")]
    PoolUnavailable,
    #[error("Failed to start the worker pool: {0}")]
    PoolBuild(#[from] ThreadPoolBuildError),
    #[error(
        "The fixed-effect design matrix is rank deficient ({rank} estimable directions for {columns} columns and {samples} samples), so no row can be fitted. Remove confounded or redundant terms. {hint}",
        hint = RESCALE_HINT
    )]
    DesignRankDeficient {
        rank: usize,
        columns: usize,
        samples: usize,
    },
    #[error("The probe fit of the first row failed: {0}")]
    Solver(#[from] SolverError),
    #[error("Failed to load inputs: {0}")]
    Input(#[from] InputError),
    #[error("Internal error while reassembling chunk results: {0}")]
    Merge(#[from] MergeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("Failed to read or write options file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML options file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize options to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Every tunable of a run. The weights matrix travels with the inputs and the
/// transform is an argument of [`fit_each`]; neither is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionOptions {
    /// Use the weights matrix when one is supplied.
    pub use_weights: bool,
    /// REML instead of ML for mixed models. Fractions of fixed and random terms
    /// are only comparable under ML.
    pub reml: bool,
    pub show_warnings: bool,
    pub chunk_count: usize,
    pub quiet: bool,
    pub colinearity_cutoff: f64,
    pub adjust_terms: Vec<String>,
    pub adjust_all: bool,
    pub control: SolverControl,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            use_weights: true,
            reml: false,
            show_warnings: true,
            chunk_count: DEFAULT_CHUNK_COUNT,
            quiet: false,
            colinearity_cutoff: DEFAULT_COLINEARITY_CUTOFF,
            adjust_terms: Vec::new(),
            adjust_all: false,
            control: SolverControl::default(),
        }
    }
}

impl PartitionOptions {
    pub fn from_toml_file(path: &Path) -> Result<Self, OptionsError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn to_toml_file(&self, path: &Path) -> Result<(), OptionsError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn adjustment(&self) -> Adjustment {
        Adjustment {
            terms: self.adjust_terms.clone(),
            all: self.adjust_all,
        }
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        if self.chunk_count == 0 {
            return Err(ConfigurationError::InvalidChunkCount);
        }
        if !(self.colinearity_cutoff > 0.0 && self.colinearity_cutoff <= 1.0) {
            return Err(ConfigurationError::InvalidColinearityCutoff(self.colinearity_cutoff));
        }
        Ok(())
    }
}

/// Ingestion checks over every row, run before any model is fitted.
fn prescan(rows: RowWeightedIterator<'_>) -> Result<(), ConfigurationError> {
    for unit in rows {
        if unit.response.iter().any(|v| !v.is_finite()) {
            return Err(ConfigurationError::NonFinite {
                row: unit.index,
                id: unit.id.to_string(),
            });
        }
        let first = unit.response.iter().next().copied().unwrap_or_default();
        if unit.response.iter().all(|&v| v == first) {
            return Err(ConfigurationError::ZeroVariance {
                row: unit.index,
                id: unit.id.to_string(),
            });
        }
        if let Some(weights) = unit.weights {
            if weights.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
                return Err(ConfigurationError::InvalidWeights {
                    row: unit.index,
                    id: unit.id.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_samples(inputs: &CoreInputs) -> Result<(), ConfigurationError> {
    let samples = inputs.expression.ncols();
    let metadata = &inputs.metadata;
    if metadata.nrows() != samples {
        return Err(ConfigurationError::MetadataRows {
            expected: samples,
            found: metadata.nrows(),
        });
    }
    if let Some(sample_ids) = &inputs.sample_ids {
        let mismatch = sample_ids
            .iter()
            .zip(metadata.sample_ids())
            .enumerate()
            .find(|(_, (expression, meta))| expression != meta);
        if let Some((position, (expression, meta))) = mismatch {
            return Err(ConfigurationError::SampleMismatch {
                position,
                expression: expression.clone(),
                metadata: meta.clone(),
            });
        }
    }
    Ok(())
}

/// Fits every row and applies `transform` to each validated fit.
///
/// Structural problems (shapes, unknown variables, constant rows, a rank
/// deficient design, a dead pool) abort before any row is fitted. Anything
/// that goes wrong for a single row afterwards is recorded in that row's slot.
pub fn fit_each<S, T, E, F>(
    inputs: &CoreInputs,
    formula: &Formula,
    options: &PartitionOptions,
    solver: &S,
    pool: &WorkerPool,
    transform: F,
) -> Result<FitCollection<T>, PartitionError>
where
    S: ModelSolver + ?Sized,
    T: Send,
    E: Display,
    F: Fn(FitResult) -> Result<T, E> + Sync,
{
    let run_start = Instant::now();
    if !pool.is_live() {
        return Err(PartitionError::PoolUnavailable);
    }
    options.check()?;

    let source = RowWeightedIterator::new(
        inputs.expression.view(),
        inputs.weights.as_ref().map(|w| w.view()),
        &inputs.row_ids,
        options.use_weights,
    )?;
    check_samples(inputs)?;
    prescan(source.clone())?;
    let design = ModelDesign::build(formula, &inputs.metadata).map_err(ConfigurationError::from)?;

    let n_rows = source.len();
    let n_samples = source.n_samples();
    let Some(first) = source.clone().next() else {
        log::warn!("The expression matrix has no rows; nothing to fit.");
        return Ok(FitCollection {
            row_ids: Vec::new(),
            n_samples,
            method: if design.has_random_terms() {
                EffectsKind::Mixed
            } else {
                EffectsKind::Fixed
            },
            results: Vec::new(),
        });
    };

    let settings = FitSettings {
        reml: options.reml,
        control: &options.control,
        validator: ModelStatusValidator::new(options.colinearity_cutoff),
        show_warnings: options.show_warnings,
    };
    let orchestrator = ModelFitOrchestrator::probe(&design, solver, settings, &first)?;
    CostProjection {
        first_row: orchestrator.probe_elapsed(),
        rows: n_rows,
        threads: pool.threads(),
    }
    .log();

    let planner = ChunkPlanner::new(source, options.chunk_count)?;
    log::info!(
        "Fitting {} models of '{}' to {} rows x {} samples{} in {} chunks on {} threads.",
        orchestrator.kind(),
        formula,
        n_rows,
        n_samples,
        if source_is_weighted(inputs, options) { " (weighted)" } else { "" },
        planner.len(),
        pool.threads()
    );

    let mut progress = ProgressBarObserver::new("Fitting models", options.quiet);
    let chunks: Vec<Chunk<'_>> = planner.chunks().collect();
    let results = ParallelReducer::new(pool).run(
        chunks,
        |chunk| orchestrator.run_chunk(chunk, &transform),
        &mut progress,
    )?;

    let collection = FitCollection {
        row_ids: inputs.row_ids.clone(),
        n_samples,
        method: orchestrator.kind(),
        results,
    };
    let mut failed = 0;
    for failure in collection.failures() {
        failed += 1;
        log::warn!("{failure}");
    }
    log::info!(
        "Finished {} rows in {:.2?} ({} failed).",
        collection.len(),
        run_start.elapsed(),
        failed
    );
    Ok(collection)
}

fn source_is_weighted(inputs: &CoreInputs, options: &PartitionOptions) -> bool {
    options.use_weights && inputs.weights.is_some()
}

/// Fits every row and returns the raw fits.
pub fn fit_all<S: ModelSolver + ?Sized>(
    inputs: &CoreInputs,
    formula: &Formula,
    options: &PartitionOptions,
    solver: &S,
    pool: &WorkerPool,
) -> Result<FitCollection<FitResult>, PartitionError> {
    fit_each(inputs, formula, options, solver, pool, Ok::<FitResult, Infallible>)
}

/// Fits every row and decomposes its variance into per-term fractions.
pub fn fit_and_decompose<S: ModelSolver + ?Sized>(
    inputs: &CoreInputs,
    formula: &Formula,
    options: &PartitionOptions,
    solver: &S,
    pool: &WorkerPool,
) -> Result<VarPartTable, PartitionError> {
    let adjustment = options.adjustment();
    if let Some(unknown) = adjustment.terms.iter().find(|t| !formula.contains(t)) {
        return Err(ConfigurationError::UnknownAdjustTerm(unknown.clone()).into());
    }
    let term_names = formula.term_names();
    if adjustment.is_active() {
        log::info!(
            "Reporting fractions adjusted for: {}.",
            adjustment.adjusted_for(&term_names).join(", ")
        );
    }

    let collection = fit_each(inputs, formula, options, solver, pool, |fit| {
        decompose(&fit, &adjustment)
    })?;

    // Reported here, in row order, so the log is the same for every schedule.
    for (id, row) in collection.row_ids.iter().zip(&collection.results) {
        if let Ok(VarPartRow { clipped, .. }) = row {
            for (term, raw) in clipped {
                log::warn!("Row '{id}': negative contribution {raw:.6e} of '{term}' clipped to zero.");
            }
        }
    }

    Ok(VarPartTable {
        row_ids: collection.row_ids,
        columns: adjustment.columns(&term_names),
        rows: collection.results,
        method: collection.method,
        adjusted_for: adjustment.adjusted_for(&term_names),
    })
}
