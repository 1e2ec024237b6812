//! # Sample Metadata
//!
//! One row per sample, one column per candidate explanatory variable. String
//! columns are categorical; numeric columns are continuous covariates. The
//! table is read-only for the whole run and is shared by every worker.

use ndarray::Array1;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The values of one metadata variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Array1<f64>),
    Categorical(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Categorical(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-sample labels; numeric values are rendered so they can act as group labels.
    pub fn labels(&self) -> Vec<String> {
        match self {
            Column::Numeric(values) => values.iter().map(|v| v.to_string()).collect(),
            Column::Categorical(values) => values.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The metadata column '{column}' has {found} values, but the table has {expected} samples.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("The metadata column '{0}' is defined more than once.")]
    DuplicateColumn(String),
    #[error(
        "Missing or null values were found in metadata column '{0}'. Every sample needs a value for every variable."
    )]
    MissingValues(String),
    #[error("Non-finite values (NaN or Infinity) were found in metadata column '{0}'.")]
    NonFinite(String),
    #[error("The metadata file has no columns besides the sample identifiers.")]
    NoVariables,
}

/// Sample metadata table keyed by sample identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    sample_ids: Vec<String>,
    columns: Vec<(String, Column)>,
}

impl Metadata {
    pub fn new(sample_ids: Vec<String>) -> Self {
        Self {
            sample_ids,
            columns: Vec::new(),
        }
    }

    /// Adds a column, builder style.
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self, MetadataError> {
        self.insert(name, column)?;
        Ok(self)
    }

    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), MetadataError> {
        let name = name.into();
        if column.len() != self.sample_ids.len() {
            return Err(MetadataError::LengthMismatch {
                column: name,
                expected: self.sample_ids.len(),
                found: column.len(),
            });
        }
        if let Column::Numeric(values) = &column {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(MetadataError::NonFinite(name));
            }
        }
        if self.column(&name).is_some() {
            return Err(MetadataError::DuplicateColumn(name));
        }
        self.columns.push((name, column));
        Ok(())
    }

    pub fn nrows(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(column_name, _)| column_name == name)
            .map(|(_, column)| column)
    }

    /// Reads a tab-separated metadata file.
    ///
    /// Sample identifiers come from a `sample_id` column when present, otherwise
    /// from the first column. String columns become categorical variables and
    /// every other column is cast to `f64`.
    pub fn from_tsv(path: &Path) -> Result<Self, MetadataError> {
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let names: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
        let id_column = if names.iter().any(|n| n == "sample_id") {
            "sample_id".to_string()
        } else {
            match names.first() {
                Some(first) => first.clone(),
                None => return Err(MetadataError::NoVariables),
            }
        };
        if names.len() < 2 {
            return Err(MetadataError::NoVariables);
        }

        let sample_ids = string_column(&df, &id_column)?;
        let mut metadata = Metadata::new(sample_ids);
        for name in names.iter().filter(|n| **n != id_column) {
            let column = df.column(name)?;
            if column.null_count() > 0 {
                return Err(MetadataError::MissingValues(name.clone()));
            }
            let parsed = match column.dtype() {
                DataType::String => Column::Categorical(string_column(&df, name)?),
                DataType::Boolean => Column::Categorical(string_column(&df, name)?),
                _ => {
                    let casted = column.cast(&DataType::Float64)?;
                    if casted.null_count() > 0 {
                        return Err(MetadataError::MissingValues(name.clone()));
                    }
                    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
                    Column::Numeric(Array1::from_vec(values))
                }
            };
            metadata.insert(name.clone(), parsed)?;
        }
        log::info!(
            "Loaded metadata for {} samples with {} variables from '{}'.",
            metadata.nrows(),
            metadata.columns.len(),
            path.display()
        );
        Ok(metadata)
    }
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>, MetadataError> {
    let column = df.column(name)?;
    if column.null_count() > 0 {
        return Err(MetadataError::MissingValues(name.to_string()));
    }
    let casted = column.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().to_string())
        .collect();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn builder_rejects_length_mismatch_and_duplicates() {
        let ids: Vec<String> = (1..=3).map(|i| format!("s{i}")).collect();
        let err = Metadata::new(ids.clone())
            .with_column("Age", Column::Numeric(array![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, MetadataError::LengthMismatch { expected: 3, found: 2, .. }));

        let err = Metadata::new(ids)
            .with_column("Age", Column::Numeric(array![1.0, 2.0, 3.0]))
            .and_then(|m| m.with_column("Age", Column::Numeric(array![1.0, 2.0, 3.0])))
            .unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateColumn(name) if name == "Age"));
    }

    #[test]
    fn tsv_columns_are_typed_by_content() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sample\tAge\tIndividual").unwrap();
        writeln!(file, "a\t31.5\tind1").unwrap();
        writeln!(file, "b\t40\tind1").unwrap();
        writeln!(file, "c\t22\tind2").unwrap();
        file.flush().unwrap();

        let metadata = Metadata::from_tsv(file.path()).unwrap();
        assert_eq!(metadata.sample_ids(), &["a", "b", "c"]);
        assert_eq!(
            metadata.column("Age"),
            Some(&Column::Numeric(array![31.5, 40.0, 22.0]))
        );
        assert_eq!(
            metadata.column("Individual"),
            Some(&Column::Categorical(vec![
                "ind1".to_string(),
                "ind1".to_string(),
                "ind2".to_string()
            ]))
        );
        assert!(metadata.column("sample").is_none());
    }
}
