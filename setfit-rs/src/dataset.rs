//! Dataset loading, column validation and column mapping.
//!
//! A [`Dataset`] is a small column table of JSON values. The trainer needs
//! exactly two columns, `text` and `label`; anything else is carried along
//! under a `feat_` prefix once a column mapping is applied.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SchemaError, SetFitError};
use crate::model::Label;

/// Source column name to target column name.
pub type ColumnMapping = BTreeMap<String, String>;

/// Columns every training or evaluation split must provide.
pub const REQUIRED_COLUMNS: [&str; 2] = ["label", "text"];

/// Prefix given to columns a mapping does not mention.
pub const EXTRA_COLUMN_PREFIX: &str = "feat_";

/// Output formatting metadata attached to a dataset.
///
/// Carried through renames untouched apart from the column names it lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFormat {
    /// Output type (`"numpy"`, `"torch"`, ...). `None` means plain values.
    pub kind: Option<String>,
    /// Columns exposed in that format; `None` means all of them.
    pub columns: Option<Vec<String>>,
    /// Whether columns outside `columns` are still returned.
    pub output_all_columns: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    values: Vec<Value>,
}

/// A single split: an ordered set of equally long columns.
///
/// # Example
///
/// ```rust
/// use setfit_rs::dataset::Dataset;
/// use setfit_rs::model::Label;
///
/// let dataset = Dataset::from_texts_and_labels(
///     vec!["great movie".to_string(), "awful plot".to_string()],
///     vec![Label::Single(1), Label::Single(0)],
/// );
///
/// assert_eq!(dataset.len(), 2);
/// assert_eq!(dataset.column_names(), vec!["text", "label"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    num_rows: usize,
    format: DatasetFormat,
}

impl Dataset {
    /// Build a dataset from named columns.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Dataset`] when the columns differ in length or a
    /// name repeats.
    pub fn from_columns<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: Into<String>,
    {
        let mut dataset = Self::default();
        for (name, values) in columns {
            let name = name.into();
            if dataset.column(&name).is_some() {
                return Err(SetFitError::Dataset(format!("duplicate column: {name}")));
            }
            if !dataset.columns.is_empty() && values.len() != dataset.num_rows {
                return Err(SetFitError::Dataset(format!(
                    "column {name} has {} rows, expected {}",
                    values.len(),
                    dataset.num_rows
                )));
            }
            dataset.num_rows = values.len();
            dataset.columns.push(Column { name, values });
        }
        Ok(dataset)
    }

    /// Build a `text`/`label` dataset from parallel arrays.
    ///
    /// # Panics
    ///
    /// Panics if the arrays differ in length.
    #[must_use]
    pub fn from_texts_and_labels(texts: Vec<String>, labels: Vec<Label>) -> Self {
        assert_eq!(texts.len(), labels.len(), "texts and labels must align");
        let num_rows = texts.len();
        Self {
            columns: vec![
                Column {
                    name: "text".into(),
                    values: texts.into_iter().map(Value::String).collect(),
                },
                Column {
                    name: "label".into(),
                    values: labels.iter().map(Label::to_json).collect(),
                },
            ],
            num_rows,
            format: DatasetFormat::default(),
        }
    }

    /// Load a JSONL file, one JSON object per line.
    ///
    /// New columns are appended as they are first seen (keys of one line in
    /// sorted order); rows missing a column get `null`.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Dataset`] if the file does not exist or a line
    /// is not a JSON object.
    pub fn from_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SetFitError::Dataset(format!(
                "Dataset not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let mut dataset = Self::default();

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let row: serde_json::Map<String, Value> = serde_json::from_str(line).map_err(|e| {
                SetFitError::Dataset(format!("Failed to parse line {}: {e}", line_no + 1))
            })?;
            dataset.push_row(row);
        }

        Ok(dataset)
    }

    fn push_row(&mut self, mut row: serde_json::Map<String, Value>) {
        for column in &mut self.columns {
            column.values.push(row.remove(&column.name).unwrap_or(Value::Null));
        }
        for (name, value) in row {
            let mut values = vec![Value::Null; self.num_rows];
            values.push(value);
            self.columns.push(Column { name, values });
        }
        self.num_rows += 1;
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_rows
    }

    /// Check if the dataset has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Column names in order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Values of one column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    /// Formatting metadata.
    #[must_use]
    pub fn format(&self) -> &DatasetFormat {
        &self.format
    }

    /// Replace the formatting metadata.
    #[must_use]
    pub fn with_format(mut self, format: DatasetFormat) -> Self {
        self.format = format;
        self
    }

    /// Rename columns; names absent from `renames` are kept.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Dataset`] when a source column does not exist or
    /// two columns would end up with the same name.
    pub fn rename_columns(mut self, renames: &BTreeMap<String, String>) -> Result<Self> {
        for source in renames.keys() {
            if self.column(source).is_none() {
                return Err(SetFitError::Dataset(format!(
                    "cannot rename missing column: {source}"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for column in &mut self.columns {
            if let Some(target) = renames.get(&column.name) {
                column.name.clone_from(target);
            }
            if !seen.insert(column.name.clone()) {
                return Err(SetFitError::Dataset(format!(
                    "renaming produces duplicate column: {}",
                    column.name
                )));
            }
        }
        Ok(self)
    }

    /// The `text` column as strings.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Dataset`] if the column is absent or holds a
    /// non-string value.
    pub fn texts(&self) -> Result<Vec<String>> {
        let column = self.required_column("text")?;
        column
            .iter()
            .enumerate()
            .map(|(row, value)| match value {
                Value::String(text) => Ok(text.clone()),
                other => Err(SetFitError::Dataset(format!(
                    "row {row}: text must be a string, got {other}"
                ))),
            })
            .collect()
    }

    /// The `label` column as [`Label`]s.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Dataset`] if the column is absent or holds a
    /// value that is neither a class id nor a multi-hot array.
    pub fn labels(&self) -> Result<Vec<Label>> {
        let column = self.required_column("label")?;
        column
            .iter()
            .enumerate()
            .map(|(row, value)| {
                Label::from_json(value).ok_or_else(|| {
                    SetFitError::Dataset(format!(
                        "row {row}: label must be a class id or a multi-hot array, got {value}"
                    ))
                })
            })
            .collect()
    }

    fn required_column(&self, name: &str) -> Result<&[Value]> {
        self.column(name)
            .ok_or_else(|| SetFitError::Dataset(format!("missing column: {name}")))
    }
}

/// Several named splits, such as `train` and `test`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetDict {
    splits: BTreeMap<String, Dataset>,
}

impl DatasetDict {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a split.
    #[must_use]
    pub fn with_split(mut self, name: impl Into<String>, dataset: Dataset) -> Self {
        self.splits.insert(name.into(), dataset);
        self
    }

    /// Look up a split.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.splits.get(name)
    }

    /// Split names, sorted.
    #[must_use]
    pub fn split_names(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }
}

/// Anything the trainer accepts as a training or evaluation dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetSource {
    /// A single split.
    Single(Dataset),
    /// A multi-split container; rejected by validation.
    Dict(DatasetDict),
}

impl From<Dataset> for DatasetSource {
    fn from(dataset: Dataset) -> Self {
        DatasetSource::Single(dataset)
    }
}

impl From<DatasetDict> for DatasetSource {
    fn from(dict: DatasetDict) -> Self {
        DatasetSource::Dict(dict)
    }
}

/// Check that `source` is a single split that yields `text` and `label`,
/// either directly or through `mapping`.
///
/// # Errors
///
/// - [`SchemaError::MultiSplit`] for a [`DatasetDict`]
/// - [`SchemaError::MissingColumns`] without a mapping
/// - [`SchemaError::IncompleteMapping`] or [`SchemaError::UnknownColumns`]
///   with one
pub fn validate_column_mapping<'a>(
    source: &'a DatasetSource,
    mapping: Option<&ColumnMapping>,
) -> std::result::Result<&'a Dataset, SchemaError> {
    let dataset = match source {
        DatasetSource::Single(dataset) => dataset,
        DatasetSource::Dict(dict) => {
            return Err(SchemaError::MultiSplit {
                splits: dict.split_names(),
            })
        }
    };

    let found: BTreeSet<&str> = dataset.column_names().into_iter().collect();
    let sorted_found = || found.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();

    let Some(mapping) = mapping else {
        if REQUIRED_COLUMNS.iter().all(|c| found.contains(c)) {
            return Ok(dataset);
        }
        return Err(SchemaError::MissingColumns {
            required: REQUIRED_COLUMNS.map(String::from).to_vec(),
            found: sorted_found(),
        });
    };

    let targets: BTreeSet<&str> = mapping.values().map(String::as_str).collect();
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !targets.contains(*c))
        .map(|c| (*c).to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SchemaError::IncompleteMapping { missing });
    }

    if !mapping.keys().all(|source| found.contains(source.as_str())) {
        return Err(SchemaError::UnknownColumns {
            expected: mapping.keys().cloned().collect(),
            found: sorted_found(),
        });
    }

    Ok(dataset)
}

/// Rename mapped columns and prefix every other column with `feat_`,
/// keeping the dataset's format metadata.
///
/// # Errors
///
/// Returns [`SetFitError::Dataset`] when the renames collide.
pub fn apply_column_mapping(dataset: &Dataset, mapping: &ColumnMapping) -> Result<Dataset> {
    let renames: BTreeMap<String, String> = dataset
        .column_names()
        .into_iter()
        .map(|name| {
            let target = mapping
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("{EXTRA_COLUMN_PREFIX}{name}"));
            (name.to_string(), target)
        })
        .collect();

    let mut format = dataset.format().clone();
    if let Some(columns) = format.columns.as_mut() {
        for column in columns.iter_mut() {
            if let Some(target) = renames.get(column.as_str()) {
                column.clone_from(target);
            }
        }
    }

    Ok(dataset.clone().rename_columns(&renames)?.with_format(format))
}

/// Validate `source`, apply `mapping` when present, and extract the
/// `text` and `label` arrays.
///
/// # Errors
///
/// Propagates schema errors from [`validate_column_mapping`] and extraction
/// errors from [`Dataset::texts`] / [`Dataset::labels`].
pub fn prepare_split(
    source: &DatasetSource,
    mapping: Option<&ColumnMapping>,
) -> Result<(Vec<String>, Vec<Label>)> {
    let dataset = validate_column_mapping(source, mapping)?;
    match mapping {
        Some(mapping) => {
            let mapped = apply_column_mapping(dataset, mapping)?;
            Ok((mapped.texts()?, mapped.labels()?))
        }
        None => Ok((dataset.texts()?, dataset.labels()?)),
    }
}
