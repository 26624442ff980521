//! # setfit-rs
//!
//! Few-shot fine-tuning of sentence-embedding classifiers.
//!
//! A handful of labeled examples is expanded into contrastive training data,
//! the embedding body is fine-tuned on it, and a lightweight classification
//! head is fitted on the resulting embeddings.
//!
//! ## Features
//!
//! - **Pair generation** - positive/negative pairs for single- and multi-label data
//! - **Loss strategies** - cosine similarity, the batch triplet family and
//!   supervised contrastive loss, each with its own data path
//! - **Two-phase training** - body then head, with separate histories
//! - **Hyperparameter search** - pluggable backends that retrain per trial
//! - **YAML Configuration** - presets and file-based runs
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! setfit init setfit.yaml --preset batch-hard
//!
//! # Validate it
//! setfit validate setfit.yaml
//!
//! # Inspect the contrastive pairs it would train on
//! setfit pairs --config setfit.yaml --output pairs.jsonl
//! ```
//!
//! ## Quick Start (Library)
//!
//! The embedding network and head are supplied by the caller through
//! [`model::SetFitModel`].
//!
//! ```no_run
//! use setfit_rs::{Dataset, SetFitTrainer, TrainOptions, TrainingArguments};
//! use setfit_rs::model::{BoxedModel, Label};
//!
//! # fn load_model() -> BoxedModel { unimplemented!() }
//! # fn main() -> setfit_rs::Result<()> {
//! let train = Dataset::from_texts_and_labels(
//!     vec!["loved it".into(), "hated it".into()],
//!     vec![Label::Single(1), Label::Single(0)],
//! );
//!
//! let mut trainer = SetFitTrainer::builder()
//!     .model(load_model())
//!     .train_dataset(train.clone())
//!     .eval_dataset(train)
//!     .args(TrainingArguments {
//!         num_iterations: 10,
//!         ..Default::default()
//!     })
//!     .build()?;
//!
//! trainer.train(TrainOptions::default())?;
//! println!("{:?}", trainer.evaluate(None)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use setfit_rs::SetFitConfig;
//! use setfit_rs::config::LossKind;
//!
//! # fn main() -> setfit_rs::Result<()> {
//! let mut config = SetFitConfig::from_preset("supcon")?;
//! assert_eq!(config.training.loss, Some(LossKind::SupervisedContrastive));
//!
//! config.training.num_epochs = 3;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod history;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod pairs;
pub mod sampler;
pub mod scheduler;
pub mod search;
pub mod trainer;

// Deterministic model for testing without a real embedding network
#[cfg(any(test, feature = "mock-model"))]
pub mod mocks;

pub use config::{SetFitConfig, TrainingArguments};
pub use dataset::{Dataset, DatasetDict, DatasetSource};
pub use error::{Result, SetFitError};
pub use evaluation::Metric;
pub use search::{BestRun, SearchOptions};
pub use trainer::{SetFitTrainer, TrainOptions, TrainOverrides};
