//! # Input Adapters
//!
//! The engine consumes one shape of input, [`CoreInputs`]: a rows × samples
//! response matrix, row identifiers, an optional same-shaped weights matrix,
//! and the sample metadata. Each adapter converts one kind of source into that
//! shape, once, at the boundary.

use crate::model::metadata::{Metadata, MetadataError};
use ndarray::Array2;
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to load metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("The matrix file '{0}' has no sample columns.")]
    NoSamples(PathBuf),
    #[error("Missing values were found in column '{column}' of '{path}'.")]
    MissingValues { path: PathBuf, column: String },
    #[error("Column '{column}' of '{path}' is not numeric (found {found}).")]
    NotNumeric {
        path: PathBuf,
        column: String,
        found: String,
    },
    #[error("Sample '{0}' from the metadata has no column in the expression matrix.")]
    SampleNotInMatrix(String),
    #[error("The weights matrix does not list the same {what} as the expression matrix.")]
    WeightsLabelMismatch { what: &'static str },
    #[error("The {what} has {found} entries, but the expression matrix has {expected}.")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
}

/// The common input of every run.
#[derive(Debug, Clone)]
pub struct CoreInputs {
    /// Rows × samples.
    pub expression: Array2<f64>,
    pub row_ids: Vec<String>,
    /// Sample labels of the expression columns, when the source has them.
    /// They must match the metadata sample order.
    pub sample_ids: Option<Vec<String>>,
    pub weights: Option<Array2<f64>>,
    pub metadata: Metadata,
}

pub trait InputAdapter {
    fn to_core_inputs(self) -> Result<CoreInputs, InputError>;
}

/// An in-memory matrix. Rows without identifiers are named `row1`, `row2`, ...
#[derive(Debug, Clone)]
pub struct DenseInput {
    pub expression: Array2<f64>,
    pub row_ids: Option<Vec<String>>,
    pub weights: Option<Array2<f64>>,
    pub metadata: Metadata,
}

impl DenseInput {
    pub fn new(expression: Array2<f64>, metadata: Metadata) -> Self {
        Self {
            expression,
            row_ids: None,
            weights: None,
            metadata,
        }
    }

    pub fn with_row_ids(mut self, row_ids: Vec<String>) -> Self {
        self.row_ids = Some(row_ids);
        self
    }

    pub fn with_weights(mut self, weights: Array2<f64>) -> Self {
        self.weights = Some(weights);
        self
    }
}

impl InputAdapter for DenseInput {
    fn to_core_inputs(self) -> Result<CoreInputs, InputError> {
        let rows = self.expression.nrows();
        let row_ids = match self.row_ids {
            Some(ids) if ids.len() != rows => {
                return Err(InputError::LengthMismatch {
                    what: "row identifier list",
                    expected: rows,
                    found: ids.len(),
                });
            }
            Some(ids) => ids,
            None => (1..=rows).map(|i| format!("row{i}")).collect(),
        };
        Ok(CoreInputs {
            expression: self.expression,
            row_ids,
            sample_ids: None,
            weights: self.weights,
            metadata: self.metadata,
        })
    }
}

/// Expression values bundled with their precision weights.
#[derive(Debug, Clone)]
pub struct WeightedExpression {
    pub expression: Array2<f64>,
    pub weights: Array2<f64>,
    pub row_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub metadata: Metadata,
}

impl InputAdapter for WeightedExpression {
    fn to_core_inputs(self) -> Result<CoreInputs, InputError> {
        if self.row_ids.len() != self.expression.nrows() {
            return Err(InputError::LengthMismatch {
                what: "row identifier list",
                expected: self.expression.nrows(),
                found: self.row_ids.len(),
            });
        }
        if self.sample_ids.len() != self.expression.ncols() {
            return Err(InputError::LengthMismatch {
                what: "sample identifier list",
                expected: self.expression.ncols(),
                found: self.sample_ids.len(),
            });
        }
        Ok(CoreInputs {
            expression: self.expression,
            row_ids: self.row_ids,
            sample_ids: Some(self.sample_ids),
            weights: Some(self.weights),
            metadata: self.metadata,
        })
    }
}

/// Tab-separated files on disk.
///
/// Matrix files have a header of sample identifiers and one row per feature,
/// the first column holding the row identifier. Matrix columns are put in the
/// metadata's sample order.
#[derive(Debug, Clone)]
pub struct TsvInput {
    pub expression: PathBuf,
    pub weights: Option<PathBuf>,
    pub metadata: PathBuf,
}

impl InputAdapter for TsvInput {
    fn to_core_inputs(self) -> Result<CoreInputs, InputError> {
        let metadata = Metadata::from_tsv(&self.metadata)?;
        let order = metadata.sample_ids();

        let expression = LabeledMatrix::from_tsv(&self.expression)?;
        let weights = match &self.weights {
            Some(path) => {
                let weights = LabeledMatrix::from_tsv(path)?;
                if weights.row_ids != expression.row_ids {
                    return Err(InputError::WeightsLabelMismatch { what: "row identifiers" });
                }
                if weights.sample_ids != expression.sample_ids {
                    return Err(InputError::WeightsLabelMismatch { what: "sample identifiers" });
                }
                Some(weights.reordered(order)?)
            }
            None => None,
        };
        let LabeledMatrix { row_ids, values, .. } = expression.reordered(order)?;

        log::info!(
            "Loaded expression matrix '{}' with {} rows and {} samples{}.",
            self.expression.display(),
            values.nrows(),
            values.ncols(),
            if weights.is_some() { " plus weights" } else { "" }
        );
        Ok(CoreInputs {
            expression: values,
            row_ids,
            sample_ids: Some(order.to_vec()),
            weights: weights.map(|w| w.values),
            metadata,
        })
    }
}

struct LabeledMatrix {
    row_ids: Vec<String>,
    sample_ids: Vec<String>,
    values: Array2<f64>,
}

impl LabeledMatrix {
    fn from_tsv(path: &Path) -> Result<Self, InputError> {
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let names: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
        let Some((id_column, sample_ids)) = names.split_first() else {
            return Err(InputError::NoSamples(path.to_path_buf()));
        };
        if sample_ids.is_empty() {
            return Err(InputError::NoSamples(path.to_path_buf()));
        }

        let ids = df.column(id_column)?.cast(&DataType::String)?;
        let row_ids = ids
            .str()?
            .into_iter()
            .enumerate()
            .map(|(i, id)| id.map(str::to_string).unwrap_or_else(|| format!("row{}", i + 1)))
            .collect();

        let mut values = Array2::zeros((df.height(), sample_ids.len()));
        for (j, name) in sample_ids.iter().enumerate() {
            let column = df.column(name)?;
            if column.null_count() > 0 {
                return Err(InputError::MissingValues {
                    path: path.to_path_buf(),
                    column: name.clone(),
                });
            }
            let casted = column.cast(&DataType::Float64).map_err(|_| InputError::NotNumeric {
                path: path.to_path_buf(),
                column: name.clone(),
                found: format!("{:?}", column.dtype()),
            })?;
            if casted.null_count() > 0 {
                return Err(InputError::NotNumeric {
                    path: path.to_path_buf(),
                    column: name.clone(),
                    found: format!("{:?}", column.dtype()),
                });
            }
            for (i, value) in casted.f64()?.rechunk().into_no_null_iter().enumerate() {
                values[(i, j)] = value;
            }
        }

        Ok(Self {
            row_ids,
            sample_ids: sample_ids.to_vec(),
            values,
        })
    }

    /// Columns rearranged into `order`; samples not in `order` are dropped.
    fn reordered(self, order: &[String]) -> Result<Self, InputError> {
        if self.sample_ids == order {
            return Ok(self);
        }
        let positions = order
            .iter()
            .map(|sample| {
                self.sample_ids
                    .iter()
                    .position(|s| s == sample)
                    .ok_or_else(|| InputError::SampleNotInMatrix(sample.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let dropped = self.sample_ids.len() - positions.len();
        if dropped > 0 {
            log::info!("Ignoring {dropped} matrix columns with no metadata.");
        }
        let values = Array2::from_shape_fn((self.values.nrows(), positions.len()), |(i, j)| {
            self.values[(i, positions[j])]
        });
        Ok(Self {
            row_ids: self.row_ids,
            sample_ids: order.to_vec(),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::metadata::Column;
    use ndarray::array;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn dense_input_names_rows_when_unlabelled() {
        let metadata = Metadata::new(vec!["a".into(), "b".into()])
            .with_column("Age", Column::Numeric(array![1.0, 2.0]))
            .unwrap();
        let inputs = DenseInput::new(array![[1.0, 2.0], [3.0, 5.0]], metadata.clone())
            .to_core_inputs()
            .unwrap();
        assert_eq!(inputs.row_ids, vec!["row1", "row2"]);
        assert!(inputs.weights.is_none());

        let err = DenseInput::new(array![[1.0, 2.0]], metadata)
            .with_row_ids(vec!["x".into(), "y".into()])
            .to_core_inputs()
            .unwrap_err();
        assert!(matches!(err, InputError::LengthMismatch { expected: 1, found: 2, .. }));
    }

    #[test]
    fn tsv_matrices_follow_metadata_sample_order() {
        let dir = tempdir().unwrap();
        let expression = dir.path().join("expr.tsv");
        let weights = dir.path().join("weights.tsv");
        let metadata = dir.path().join("meta.tsv");
        fs::write(&expression, "gene\ts2\ts1\ts3\ngA\t2\t1\t3\ngB\t20\t10\t30\n").unwrap();
        fs::write(&weights, "gene\ts2\ts1\ts3\ngA\t0.2\t0.1\t0.3\ngB\t2\t1\t3\n").unwrap();
        fs::write(&metadata, "sample_id\tAge\ns1\t30\ns2\t40\ns3\t50\n").unwrap();

        let inputs = TsvInput {
            expression,
            weights: Some(weights),
            metadata,
        }
        .to_core_inputs()
        .unwrap();
        assert_eq!(inputs.row_ids, vec!["gA", "gB"]);
        assert_eq!(inputs.sample_ids.as_deref(), Some(&["s1".to_string(), "s2".into(), "s3".into()][..]));
        assert_eq!(inputs.expression.row(1).to_vec(), vec![10.0, 20.0, 30.0]);
        assert_eq!(inputs.weights.unwrap().row(0).to_vec(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn metadata_sample_missing_from_matrix_is_reported() {
        let dir = tempdir().unwrap();
        let expression = dir.path().join("expr.tsv");
        let metadata = dir.path().join("meta.tsv");
        fs::write(&expression, "gene\ts1\ts2\ngA\t1\t2\n").unwrap();
        fs::write(&metadata, "sample_id\tAge\ns1\t30\ns9\t40\n").unwrap();

        let err = TsvInput {
            expression,
            weights: None,
            metadata,
        }
        .to_core_inputs()
        .unwrap_err();
        assert!(matches!(err, InputError::SampleNotInMatrix(sample) if sample == "s9"));
    }
}
