//! Error types for setfit-rs.
//!
//! This module provides error types and result aliases for the library.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use setfit_rs::{SetFitError, TrainingArguments};
//!
//! # fn main() {
//! let args = TrainingArguments {
//!     warmup_proportion: 1.5,
//!     ..Default::default()
//! };
//!
//! match args.validate() {
//!     Ok(()) => println!("valid"),
//!     Err(SetFitError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```
//!
//! # Example - Schema Errors
//!
//! ```rust
//! use setfit_rs::error::SchemaError;
//! use setfit_rs::SetFitError;
//!
//! let err = SetFitError::from(SchemaError::MultiSplit {
//!     splits: vec!["train".to_string()],
//! });
//! assert!(err.to_string().contains("dataset['train']"));
//! ```

use thiserror::Error;

/// Result type alias for setfit-rs operations.
pub type Result<T> = std::result::Result<T, SetFitError>;

/// Errors that can occur in setfit-rs.
///
/// Every variant except the conversions is fatal for the call that raised it;
/// nothing is retried internally.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SetFitError {
    /// Configuration error, raised before any work starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The dataset does not have the shape the trainer expects.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// `model_init` failed to produce a model.
    #[error("model init error: {0}")]
    ModelInit(String),

    /// The model lacks a capability the call requires.
    #[error("capability error: {0}")]
    Capability(String),

    /// Model collaborator failure (fit, predict, upload).
    #[error("model error: {0}")]
    Model(String),

    /// Dataset loading error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for SetFitError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        SetFitError::Template(err.to_string())
    }
}

/// Dataset-shape mismatches found while validating columns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Required columns are absent and no column mapping was given.
    #[error(
        "expected the dataset to have the columns {required:?}, but only the columns {found:?} were found. \
         Either make sure these columns are present, or specify which columns to use with column_mapping"
    )]
    MissingColumns {
        /// Columns the trainer needs.
        required: Vec<String>,
        /// Columns the dataset has.
        found: Vec<String>,
    },

    /// The column mapping does not produce every required column.
    #[error("the following columns are missing from the column mapping: {missing:?}. Please provide a mapping for all required columns")]
    IncompleteMapping {
        /// Required targets no mapping entry produces.
        missing: Vec<String>,
    },

    /// The column mapping names source columns the dataset lacks.
    #[error("the column mapping expected the columns {expected:?} in the dataset, but the dataset had the columns {found:?}")]
    UnknownColumns {
        /// Source columns named by the mapping.
        expected: Vec<String>,
        /// Columns the dataset has.
        found: Vec<String>,
    },

    /// A multi-split container was passed where a single split was expected.
    #[error("{}", multi_split_message(.splits))]
    MultiSplit {
        /// The available split names, sorted.
        splits: Vec<String>,
    },
}

fn multi_split_message(splits: &[String]) -> String {
    if splits.len() == 1 && splits[0] == "train" {
        "expected a Dataset, but got a DatasetDict with the split ['train']. \
         Did you mean to select the training split with dataset['train']?"
            .to_string()
    } else {
        format!(
            "expected a Dataset, but got a DatasetDict with the splits {splits:?}. \
             Did you mean to select one of these splits from the dataset?"
        )
    }
}
