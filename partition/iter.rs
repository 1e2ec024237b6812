//! Lazy row-by-row access to the response matrix and its observation weights.
//!
//! The iterator only holds views into caller-owned matrices; a [`RowUnit`]
//! borrows its row and never copies it.

use crate::run::ConfigurationError;
use crate::types::RowUnit;
use ndarray::{ArrayView2, Axis};
use std::ops::Range;

/// Streams [`RowUnit`]s over a contiguous range of rows.
///
/// Not rewindable: construct a new iterator (or [`restrict`](Self::restrict)
/// one that has not been advanced) to start over.
#[derive(Debug, Clone)]
pub struct RowWeightedIterator<'a> {
    expression: ArrayView2<'a, f64>,
    weights: Option<ArrayView2<'a, f64>>,
    row_ids: &'a [String],
    range: Range<usize>,
}

impl<'a> RowWeightedIterator<'a> {
    /// Wraps `expression` (rows × samples). With `use_weights`, `weights` must
    /// have the same shape. Requesting weights without supplying a matrix is
    /// not an error: the iterator silently runs unweighted.
    pub fn new(
        expression: ArrayView2<'a, f64>,
        weights: Option<ArrayView2<'a, f64>>,
        row_ids: &'a [String],
        use_weights: bool,
    ) -> Result<Self, ConfigurationError> {
        let (rows, samples) = expression.dim();
        if row_ids.len() != rows {
            return Err(ConfigurationError::ShapeMismatch {
                what: "row identifiers".to_string(),
                expected: rows,
                found: row_ids.len(),
            });
        }

        let weights = match (use_weights, weights) {
            (true, Some(w)) => {
                if w.nrows() != rows {
                    return Err(ConfigurationError::ShapeMismatch {
                        what: "weights matrix rows".to_string(),
                        expected: rows,
                        found: w.nrows(),
                    });
                }
                if w.ncols() != samples {
                    return Err(ConfigurationError::ShapeMismatch {
                        what: "weights matrix columns".to_string(),
                        expected: samples,
                        found: w.ncols(),
                    });
                }
                Some(w)
            }
            (true, None) => {
                log::debug!("Weighted fitting requested without a weights matrix; fitting unweighted.");
                None
            }
            (false, _) => None,
        };

        Ok(Self {
            expression,
            weights,
            row_ids,
            range: 0..rows,
        })
    }

    /// A new iterator over `range ∩ self.range()`, sharing the same matrices.
    pub fn restrict(&self, range: Range<usize>) -> Self {
        let start = range.start.clamp(self.range.start, self.range.end);
        let end = range.end.clamp(start, self.range.end);
        Self {
            expression: self.expression,
            weights: self.weights,
            row_ids: self.row_ids,
            range: start..end,
        }
    }

    /// Rows not yet yielded.
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn n_samples(&self) -> usize {
        self.expression.ncols()
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.is_some()
    }
}

impl<'a> Iterator for RowWeightedIterator<'a> {
    type Item = RowUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.range.next()?;
        let row_ids = self.row_ids;
        Some(RowUnit {
            index,
            id: &row_ids[index],
            response: self.expression.index_axis_move(Axis(0), index),
            weights: self.weights.map(|w| w.index_axis_move(Axis(0), index)),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.range.size_hint()
    }
}

impl ExactSizeIterator for RowWeightedIterator<'_> {}
