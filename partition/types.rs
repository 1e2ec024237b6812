// ========================================================================================
//
//                       Core data types shared across the engine
//
// ========================================================================================

use crate::model::fit::EffectsKind;
use csv::WriterBuilder;
use ndarray::ArrayView1;
use std::fmt;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// The name of the residual column in every decomposition.
pub const RESIDUALS: &str = "Residuals";

/// One regression problem: a borrowed row of the response matrix and, when
/// weighting is active, the matching row of the weights matrix.
#[derive(Debug, Clone, Copy)]
pub struct RowUnit<'a> {
    /// Position of the row in the input matrix.
    pub index: usize,
    pub id: &'a str,
    pub response: ArrayView1<'a, f64>,
    pub weights: Option<ArrayView1<'a, f64>>,
}

/// A row whose model could not be fitted or validated. It occupies the row's
/// slot in the output; sibling rows are unaffected.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Row {row} ('{id}') failed: {reason}")]
pub struct RowFitFailure {
    pub row: usize,
    pub id: String,
    pub reason: String,
}

impl RowFitFailure {
    pub fn new(unit: &RowUnit<'_>, reason: impl Into<String>) -> Self {
        Self {
            row: unit.index,
            id: unit.id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Per-row outcome: the transformed fit, or the reason it failed.
pub type RowOutcome<T> = Result<T, RowFitFailure>;

/// Per-row results of a run, in input row order.
#[derive(Debug, Clone)]
pub struct FitCollection<T> {
    pub row_ids: Vec<String>,
    pub n_samples: usize,
    pub method: EffectsKind,
    pub results: Vec<RowOutcome<T>>,
}

impl<T> FitCollection<T> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RowFitFailure> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }
}

/// Variance fractions of one row, in output column order.
#[derive(Debug, Clone, PartialEq)]
pub struct VarPartRow {
    pub fractions: Vec<(String, f64)>,
    /// Terms whose raw contribution was negative and clipped to zero, with the raw value.
    pub clipped: Vec<(String, f64)>,
}

impl VarPartRow {
    pub fn get(&self, term: &str) -> Option<f64> {
        self.fractions
            .iter()
            .find(|(name, _)| name == term)
            .map(|(_, value)| *value)
    }

    pub fn sum(&self) -> f64 {
        self.fractions.iter().map(|(_, value)| value).sum()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.fractions.iter().map(|(_, value)| *value)
    }
}

/// The durable output of `fit_and_decompose`.
#[derive(Debug, Clone)]
pub struct VarPartTable {
    pub row_ids: Vec<String>,
    /// Output columns: terms in formula order, then `Residuals` unless every
    /// term was adjusted for.
    pub columns: Vec<String>,
    pub rows: Vec<RowOutcome<VarPartRow>>,
    pub method: EffectsKind,
    pub adjusted_for: Vec<String>,
}

impl VarPartTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RowFitFailure> {
        self.rows.iter().filter_map(|r| r.as_ref().err())
    }

    /// The fraction of `term` in row `row`, if the row was fitted.
    pub fn get(&self, row: usize, term: &str) -> Option<f64> {
        self.rows.get(row)?.as_ref().ok()?.get(term)
    }

    /// Writes the table as TSV: an `id` column, one column per output term.
    /// Failed rows are written as `NA`.
    pub fn write_tsv(&self, path: &Path) -> Result<(), csv::Error> {
        let file = std::fs::File::create(path)?;
        self.write_to(file)?;
        log::info!("Wrote {} rows of variance fractions to '{}'.", self.len(), path.display());
        Ok(())
    }

    pub fn write_to<W: Write>(&self, sink: W) -> Result<(), csv::Error> {
        let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(sink);
        let mut header = Vec::with_capacity(self.columns.len() + 1);
        header.push("id".to_string());
        header.extend(self.columns.iter().cloned());
        writer.write_record(&header)?;

        for (id, row) in self.row_ids.iter().zip(&self.rows) {
            let mut record = Vec::with_capacity(header.len());
            record.push(id.clone());
            match row {
                Ok(fractions) => {
                    record.extend(self.columns.iter().map(|column| match fractions.get(column) {
                        Some(value) => value.to_string(),
                        None => "NA".to_string(),
                    }));
                }
                Err(failure) => {
                    log::warn!("Writing NA for row '{}': {}", failure.id, failure.reason);
                    record.extend(self.columns.iter().map(|_| "NA".to_string()));
                }
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for VarPartTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows, {} fit, columns [{}]",
            self.len(),
            self.method,
            self.columns.join(", ")
        )?;
        if !self.adjusted_for.is_empty() {
            write!(f, ", adjusted for [{}]", self.adjusted_for.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> VarPartTable {
        VarPartTable {
            row_ids: vec!["geneA".to_string(), "geneB".to_string()],
            columns: vec!["Age".to_string(), RESIDUALS.to_string()],
            rows: vec![
                Ok(VarPartRow {
                    fractions: vec![("Age".to_string(), 0.25), (RESIDUALS.to_string(), 0.75)],
                    clipped: Vec::new(),
                }),
                Err(RowFitFailure {
                    row: 1,
                    id: "geneB".to_string(),
                    reason: "did not converge".to_string(),
                }),
            ],
            method: EffectsKind::Fixed,
            adjusted_for: Vec::new(),
        }
    }

    #[test]
    fn failed_rows_are_written_as_na() {
        let mut buffer = Vec::new();
        table().write_to(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "id\tAge\tResiduals");
        assert_eq!(lines[1], "geneA\t0.25\t0.75");
        assert_eq!(lines[2], "geneB\tNA\tNA");
    }

    #[test]
    fn lookup_by_row_and_term() {
        let table = table();
        assert_eq!(table.get(0, "Age"), Some(0.25));
        assert_eq!(table.get(1, "Age"), None);
        assert_eq!(table.failures().count(), 1);
        assert_eq!(table.to_string(), "2 rows, fixed fit, columns [Age, Residuals]");
    }
}
