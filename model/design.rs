//! # Design Construction
//!
//! The design depends only on the formula and the metadata, never on the row
//! being fitted, so it is built once per run and shared read-only by every
//! worker. Each fit then only supplies a response vector and, optionally, a
//! weight vector.
//!
//! - Fixed numeric term: one column, used as-is.
//! - Fixed categorical term: treatment-contrast indicators; levels are put in
//!   natural order and the first level is the baseline.
//! - Random term: a grouping of samples by level, one variance component.
//!
//! The intercept always occupies column 0, and fixed-term columns are laid out
//! contiguously in formula order so that nested prefixes of the design give the
//! sequential ANOVA decomposition.

use crate::model::formula::{Formula, TermKind};
use crate::model::linalg::{self, LinalgError};
use crate::model::metadata::{Column, Metadata};
use ndarray::{Array2, ArrayView2, s};
use std::ops::Range;
use thiserror::Error;

/// Relative eigenvalue threshold below which a design direction counts as null.
const RANK_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Variable '{0}' named in the formula was not found in the metadata.")]
    VariableNotFound(String),
    #[error(
        "Random effect '{term}' has {levels} levels for {samples} samples. A grouping variable needs fewer levels than samples to be separable from the residual."
    )]
    GroupingTooFine {
        term: String,
        levels: usize,
        samples: usize,
    },
    #[error("The metadata table has no samples.")]
    NoSamples,
    #[error("Failed to determine the rank of the fixed-effect design: {0}")]
    Rank(#[from] LinalgError),
}

/// The samples grouped by the levels of one random-effect variable.
#[derive(Debug, Clone)]
pub struct Grouping {
    pub term: String,
    pub levels: Vec<String>,
    /// Level index of each sample.
    pub assignment: Vec<usize>,
    /// Sample indices belonging to each level.
    pub members: Vec<Vec<usize>>,
}

impl Grouping {
    fn from_labels(term: &str, labels: &[String]) -> Self {
        let levels = sorted_levels(labels);
        let assignment: Vec<usize> = labels
            .iter()
            .map(|label| {
                levels
                    .binary_search_by(|probe| natord::compare(probe, label))
                    .unwrap_or_default()
            })
            .collect();
        let mut members = vec![Vec::new(); levels.len()];
        for (sample, &level) in assignment.iter().enumerate() {
            members[level].push(sample);
        }
        Self {
            term: term.to_string(),
            levels,
            assignment,
            members,
        }
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }
}

/// Where a formula term lives in the design.
#[derive(Debug, Clone)]
pub enum TermLayout {
    Fixed { name: String, columns: Range<usize> },
    Random { name: String, grouping: usize },
}

/// The response-independent part of every per-row model.
#[derive(Debug, Clone)]
pub struct ModelDesign {
    x: Array2<f64>,
    coefficient_names: Vec<String>,
    terms: Vec<TermLayout>,
    groupings: Vec<Grouping>,
    rank: usize,
}

impl ModelDesign {
    pub fn build(formula: &Formula, metadata: &Metadata) -> Result<Self, DesignError> {
        let n = metadata.nrows();
        if n == 0 {
            return Err(DesignError::NoSamples);
        }

        let mut blocks: Vec<Array2<f64>> = vec![Array2::ones((n, 1))];
        let mut coefficient_names = vec!["(Intercept)".to_string()];
        let mut terms = Vec::with_capacity(formula.terms().len());
        let mut groupings = Vec::new();
        let mut next_col = 1;

        for term in formula.terms() {
            let column = metadata
                .column(&term.variable)
                .ok_or_else(|| DesignError::VariableNotFound(term.variable.clone()))?;
            match term.kind {
                TermKind::Fixed => {
                    let (block, names) = fixed_block(&term.variable, column);
                    let width = block.ncols();
                    terms.push(TermLayout::Fixed {
                        name: term.variable.clone(),
                        columns: next_col..next_col + width,
                    });
                    next_col += width;
                    coefficient_names.extend(names);
                    blocks.push(block);
                }
                TermKind::Random => {
                    let grouping = Grouping::from_labels(&term.variable, &column.labels());
                    if grouping.n_levels() >= n {
                        return Err(DesignError::GroupingTooFine {
                            term: term.variable.clone(),
                            levels: grouping.n_levels(),
                            samples: n,
                        });
                    }
                    terms.push(TermLayout::Random {
                        name: term.variable.clone(),
                        grouping: groupings.len(),
                    });
                    groupings.push(grouping);
                }
            }
        }

        let mut x = Array2::zeros((n, next_col));
        let mut col = 0;
        for block in &blocks {
            let width = block.ncols();
            x.slice_mut(s![.., col..col + width]).assign(block);
            col += width;
        }
        let rank = linalg::column_rank(&x, RANK_TOLERANCE)?;

        log::debug!(
            "Built design with {} fixed columns (rank {}) and {} random groupings for {} samples.",
            x.ncols(),
            rank,
            groupings.len(),
            n
        );

        Ok(Self {
            x,
            coefficient_names,
            terms,
            groupings,
            rank,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.x.nrows()
    }

    /// Fixed-effect design matrix, intercept in column 0.
    pub fn x(&self) -> ArrayView2<'_, f64> {
        self.x.view()
    }

    pub fn n_fixed_columns(&self) -> usize {
        self.x.ncols()
    }

    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    /// Terms in formula order.
    pub fn terms(&self) -> &[TermLayout] {
        &self.terms
    }

    pub fn groupings(&self) -> &[Grouping] {
        &self.groupings
    }

    pub fn has_random_terms(&self) -> bool {
        !self.groupings.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// True when the fixed effects are not estimable with residual degrees of
    /// freedom left over: dependent columns, or as many columns as samples.
    pub fn is_rank_deficient(&self) -> bool {
        self.rank < self.n_fixed_columns() || self.n_fixed_columns() >= self.n_samples()
    }
}

fn sorted_levels(labels: &[String]) -> Vec<String> {
    let mut levels = labels.to_vec();
    levels.sort_by(|a, b| natord::compare(a, b));
    levels.dedup();
    levels
}

fn fixed_block(variable: &str, column: &Column) -> (Array2<f64>, Vec<String>) {
    match column {
        Column::Numeric(values) => {
            let block = values.view().insert_axis(ndarray::Axis(1)).to_owned();
            (block, vec![variable.to_string()])
        }
        Column::Categorical(labels) => {
            let levels = sorted_levels(labels);
            let n = labels.len();
            let width = levels.len().saturating_sub(1);
            let mut block = Array2::zeros((n, width));
            for (row, label) in labels.iter().enumerate() {
                if let Ok(level) = levels.binary_search_by(|probe| natord::compare(probe, label)) {
                    if level > 0 {
                        block[(row, level - 1)] = 1.0;
                    }
                }
            }
            let names = levels
                .iter()
                .skip(1)
                .map(|level| format!("{variable}{level}"))
                .collect();
            (block, names)
        }
    }
}
