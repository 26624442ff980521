//! Model collaborator contracts.
//!
//! The trainer never looks inside the embedding network or the classification
//! head. It drives them through two traits:
//!
//! - [`EmbeddingBody`] encodes texts and runs the contrastive fit loop for a
//!   set of objectives the trainer prepares.
//! - [`SetFitModel`] owns a body plus a head and exposes the head fit,
//!   prediction, freezing and upload.
//!
//! Both report progress through a [`TrainingListener`] handed in by
//! `&mut` reference.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SetFitError};
use crate::evaluation::ValidationLossEvaluator;
use crate::history::TrainingListener;
use crate::loss::LossObjective;
use crate::sampler::DataLoader;
use crate::scheduler::LrScheduler;
use crate::search::HyperParams;

/// Seeded generator threaded through every random draw of a training run.
pub type SeededRng = ChaCha8Rng;

/// Owned, type-erased model.
pub type BoxedModel = Box<dyn SetFitModel>;

/// Target of one example: a class id, or a multi-hot vector under a
/// multi-target strategy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Label {
    /// Single class id.
    Single(i64),
    /// Multi-hot vector; position `k` set means class `k` is active.
    Multi(Vec<u8>),
}

impl Label {
    /// Parse a JSON label: an integer (or boolean) class id, or an array of
    /// 0/1 entries.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Label::Single(i64::from(*b))),
            Value::Number(n) => n.as_i64().map(Label::Single).or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| {
                        #[allow(clippy::cast_possible_truncation)]
                        let id = f as i64;
                        Label::Single(id)
                    })
            }),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Bool(b) => Some(u8::from(*b)),
                    Value::Number(n) => match n.as_f64() {
                        Some(f) if f == 0.0 => Some(0),
                        Some(f) if f == 1.0 => Some(1),
                        _ => None,
                    },
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()
                .map(Label::Multi),
            _ => None,
        }
    }

    /// JSON form, the inverse of [`Label::from_json`].
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Label::Single(id) => Value::from(*id),
            Label::Multi(bits) => Value::from(bits.clone()),
        }
    }

    /// Active class ids.
    #[must_use]
    pub fn active_classes(&self) -> Vec<i64> {
        match self {
            Label::Single(id) => vec![*id],
            Label::Multi(bits) => bits
                .iter()
                .enumerate()
                .filter(|(_, bit)| **bit != 0)
                .filter_map(|(k, _)| i64::try_from(k).ok())
                .collect(),
        }
    }

    /// Whether the two labels share at least one active class.
    #[must_use]
    pub fn intersects(&self, other: &Label) -> bool {
        match (self, other) {
            (Label::Single(a), Label::Single(b)) => a == b,
            (Label::Multi(a), Label::Multi(b)) => {
                a.iter().zip(b).any(|(x, y)| *x != 0 && *y != 0)
            }
            _ => {
                let theirs = other.active_classes();
                self.active_classes().iter().any(|c| theirs.contains(c))
            }
        }
    }

    /// Whether this is a multi-hot label.
    #[must_use]
    pub fn is_multi(&self) -> bool {
        matches!(self, Label::Multi(_))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Single(id) => write!(f, "{id}"),
            Label::Multi(bits) => write!(f, "{bits:?}"),
        }
    }
}

/// Model output, either already on the host or still on a device.
#[derive(Debug, Clone)]
pub enum Predictions {
    /// Host-resident labels.
    Host(Vec<Label>),
    /// Rank-1 tensor of class ids, or rank-2 multi-hot tensor.
    Device(Tensor),
}

impl Predictions {
    /// Pack labels into a tensor on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Model`] when single and multi-hot labels are
    /// mixed or multi-hot rows differ in width.
    pub fn on_device(labels: &[Label], device: &Device) -> Result<Self> {
        if labels.iter().all(|l| !l.is_multi()) {
            let ids: Vec<i64> = labels
                .iter()
                .filter_map(|l| match l {
                    Label::Single(id) => Some(*id),
                    Label::Multi(_) => None,
                })
                .collect();
            let n = ids.len();
            return Ok(Predictions::Device(Tensor::from_vec(ids, n, device)?));
        }

        let mut width = None;
        let mut flat = Vec::new();
        for label in labels {
            let Label::Multi(bits) = label else {
                return Err(SetFitError::Model(
                    "cannot mix single and multi-hot predictions".into(),
                ));
            };
            if *width.get_or_insert(bits.len()) != bits.len() {
                return Err(SetFitError::Model(
                    "multi-hot predictions differ in width".into(),
                ));
            }
            flat.extend_from_slice(bits);
        }
        let shape = (labels.len(), width.unwrap_or(0));
        Ok(Predictions::Device(Tensor::from_vec(flat, shape, device)?))
    }

    /// Move predictions to the host.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Model`] for tensors that are neither rank 1 nor
    /// rank 2, and candle errors from the transfer.
    pub fn into_host(self) -> Result<Vec<Label>> {
        let tensor = match self {
            Predictions::Host(labels) => return Ok(labels),
            Predictions::Device(tensor) => tensor.to_device(&Device::Cpu)?,
        };

        match tensor.rank() {
            1 => Ok(tensor
                .to_dtype(DType::I64)?
                .to_vec1::<i64>()?
                .into_iter()
                .map(Label::Single)
                .collect()),
            2 => Ok(tensor
                .to_dtype(DType::U8)?
                .to_vec2::<u8>()?
                .into_iter()
                .map(Label::Multi)
                .collect()),
            rank => Err(SetFitError::Model(format!(
                "predictions must be rank 1 or 2, got rank {rank}"
            ))),
        }
    }
}

/// Part of a model that can be frozen independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelPart {
    /// Classification head.
    Head,
    /// Embedding body.
    Body,
}

/// How a head handles multi-label targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultiTargetStrategy {
    /// One binary classifier per class.
    OneVsRest,
    /// One multi-output classifier.
    MultiOutput,
    /// Chained binary classifiers.
    ClassifierChain,
}

/// Settings for one body fit.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyFitParams {
    /// Passes over the training loader.
    pub epochs: usize,
    /// Peak learning rate.
    pub learning_rate: f64,
    /// Linear warmup steps before the decay starts.
    pub warmup_steps: usize,
    /// Use automatic mixed precision.
    pub use_amp: bool,
    /// Show a progress bar.
    pub show_progress_bar: bool,
    /// Report every `log_steps` steps; `0` reports only the last step of an
    /// epoch.
    pub log_steps: usize,
}

impl BodyFitParams {
    /// Warmup-linear schedule across all epochs of `steps_per_epoch` steps.
    #[must_use]
    pub fn scheduler(&self, steps_per_epoch: usize) -> LrScheduler {
        LrScheduler::new(
            self.learning_rate,
            self.warmup_steps,
            steps_per_epoch * self.epochs,
        )
    }

    /// Whether 1-based `step` of an epoch with `steps_in_epoch` steps should
    /// be reported.
    #[must_use]
    pub fn should_log(&self, step: usize, steps_in_epoch: usize) -> bool {
        if self.log_steps == 0 {
            step == steps_in_epoch
        } else {
            step % self.log_steps == 0
        }
    }
}

/// One contrastive objective prepared by the trainer.
pub struct BodyObjective<'a> {
    /// Training batches.
    pub loader: &'a mut DataLoader,
    /// Loss computed on each batch.
    pub loss: &'a dyn LossObjective,
    /// Run after every epoch when present.
    pub evaluator: Option<&'a mut ValidationLossEvaluator>,
}

/// Sentence-embedding network.
pub trait EmbeddingBody {
    /// Encode texts into a `[n, dim]` float tensor.
    ///
    /// # Errors
    ///
    /// Collaborator-defined.
    fn encode(&self, texts: &[String]) -> Result<Tensor>;

    /// Run the contrastive fit loop.
    ///
    /// Implementations report steps selected by
    /// [`BodyFitParams::should_log`] through `listener.on_train_step` and,
    /// when an evaluator is present, its score after every epoch through
    /// `listener.on_eval_step`.
    ///
    /// # Errors
    ///
    /// Collaborator-defined.
    fn fit(
        &mut self,
        objective: BodyObjective<'_>,
        params: &BodyFitParams,
        listener: &mut dyn TrainingListener,
    ) -> Result<()>;
}

/// Arguments of a head fit.
#[derive(Debug, Clone)]
pub struct HeadFitArgs<'a> {
    /// Training texts.
    pub x_train: &'a [String],
    /// Training labels.
    pub y_train: &'a [Label],
    /// Evaluation split, if any.
    pub eval: Option<(&'a [String], &'a [Label])>,
    /// Epochs.
    pub num_epochs: usize,
    /// Batch size.
    pub batch_size: usize,
    /// Head learning rate.
    pub learning_rate: f64,
    /// Body learning rate for end-to-end training.
    pub body_learning_rate: Option<f64>,
    /// L2 weight.
    pub l2_weight: Option<f64>,
    /// Maximum token length.
    pub max_length: Option<usize>,
    /// Show a progress bar.
    pub show_progress_bar: bool,
}

/// Options for uploading a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOptions {
    /// Commit message.
    pub commit_message: String,
    /// Create the repository as private.
    pub private: bool,
    /// Access token.
    pub token: Option<String>,
    /// Target branch.
    pub branch: Option<String>,
    /// Open a pull request instead of committing directly.
    pub create_pr: bool,
    /// Only upload files matching these patterns.
    pub allow_patterns: Vec<String>,
    /// Skip files matching these patterns.
    pub ignore_patterns: Vec<String>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            commit_message: "Add SetFit model".into(),
            private: false,
            token: None,
            branch: None,
            create_pr: false,
            allow_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
        }
    }
}

/// An embedding body with a classification head.
pub trait SetFitModel {
    /// The embedding body.
    fn body(&self) -> &dyn EmbeddingBody;

    /// The embedding body, mutably.
    fn body_mut(&mut self) -> &mut dyn EmbeddingBody;

    /// Whether the head is trained by gradient descent together with the body.
    fn has_differentiable_head(&self) -> bool;

    /// Multi-label strategy, `None` for single-label classification.
    fn multi_target_strategy(&self) -> Option<MultiTargetStrategy> {
        None
    }

    /// Freeze one part.
    fn freeze(&mut self, part: ModelPart);

    /// Unfreeze one part.
    fn unfreeze(&mut self, part: ModelPart);

    /// Whether one part is frozen.
    fn is_frozen(&self, part: ModelPart) -> bool;

    /// Fit the head. Reports per-epoch losses through `listener`.
    ///
    /// # Errors
    ///
    /// Collaborator-defined.
    fn fit(&mut self, args: &HeadFitArgs<'_>, listener: &mut dyn TrainingListener) -> Result<()>;

    /// Predict labels.
    ///
    /// # Errors
    ///
    /// Collaborator-defined.
    fn predict(&self, texts: &[String]) -> Result<Predictions>;

    /// Upload the model and return the commit URL.
    ///
    /// # Errors
    ///
    /// Collaborator-defined.
    fn push_to_hub(&self, repo_id: &str, options: &PushOptions) -> Result<String>;
}

type PlainInit = Box<dyn Fn(&mut SeededRng) -> Option<BoxedModel>>;
type ParamInit = Box<dyn Fn(Option<&HyperParams>, &mut SeededRng) -> Option<BoxedModel>>;

/// Factory producing a fresh model, used by hyperparameter search.
///
/// The variant fixes the arity: a [`ModelInit::Plain`] factory never sees
/// trial parameters, so parameters that are not training arguments are
/// reported and dropped.
pub enum ModelInit {
    /// Takes no parameters.
    Plain(PlainInit),
    /// Receives the trial parameters (`None` outside a search).
    WithParams(ParamInit),
}

impl ModelInit {
    /// Wrap a factory that takes no parameters.
    pub fn plain<F>(init: F) -> Self
    where
        F: Fn(&mut SeededRng) -> Option<BoxedModel> + 'static,
    {
        ModelInit::Plain(Box::new(init))
    }

    /// Wrap a factory that receives trial parameters.
    pub fn with_params<F>(init: F) -> Self
    where
        F: Fn(Option<&HyperParams>, &mut SeededRng) -> Option<BoxedModel> + 'static,
    {
        ModelInit::WithParams(Box::new(init))
    }

    /// Whether the factory receives parameters.
    #[must_use]
    pub fn takes_params(&self) -> bool {
        matches!(self, ModelInit::WithParams(_))
    }

    /// Build a model.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::ModelInit`] when the factory returns nothing.
    pub fn build(&self, params: Option<&HyperParams>, rng: &mut SeededRng) -> Result<BoxedModel> {
        let model = match self {
            ModelInit::Plain(init) => init(rng),
            ModelInit::WithParams(init) => init(params, rng),
        };
        model.ok_or_else(|| SetFitError::ModelInit("model_init returned no model".into()))
    }
}

impl fmt::Debug for ModelInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelInit::Plain(_) => f.write_str("ModelInit::Plain"),
            ModelInit::WithParams(_) => f.write_str("ModelInit::WithParams"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_label_from_json() {
        assert_eq!(Label::from_json(&json!(3)), Some(Label::Single(3)));
        assert_eq!(Label::from_json(&json!(2.0)), Some(Label::Single(2)));
        assert_eq!(Label::from_json(&json!(true)), Some(Label::Single(1)));
        assert_eq!(
            Label::from_json(&json!([1, 0, 1])),
            Some(Label::Multi(vec![1, 0, 1]))
        );
        assert_eq!(Label::from_json(&json!("positive")), None);
        assert_eq!(Label::from_json(&json!([2, 0])), None);
        assert_eq!(Label::from_json(&json!(0.5)), None);
    }

    #[test]
    fn test_label_json_inverse() {
        for label in [Label::Single(-1), Label::Multi(vec![0, 1, 1])] {
            assert_eq!(Label::from_json(&label.to_json()), Some(label));
        }
    }

    #[test]
    fn test_label_intersects() {
        assert!(Label::Single(1).intersects(&Label::Single(1)));
        assert!(!Label::Single(1).intersects(&Label::Single(2)));
        assert!(Label::Multi(vec![1, 1, 0]).intersects(&Label::Multi(vec![0, 1, 0])));
        assert!(!Label::Multi(vec![1, 0, 0]).intersects(&Label::Multi(vec![0, 1, 1])));
        assert!(!Label::Multi(vec![0, 0]).intersects(&Label::Multi(vec![0, 0])));
        assert!(Label::Single(2).intersects(&Label::Multi(vec![0, 0, 1])));
    }

    #[test]
    fn test_active_classes() {
        assert_eq!(Label::Multi(vec![1, 0, 1]).active_classes(), vec![0, 2]);
        assert_eq!(Label::Single(4).active_classes(), vec![4]);
    }

    #[test]
    fn test_device_predictions_rank1() {
        let labels = vec![Label::Single(0), Label::Single(2), Label::Single(1)];
        let predictions = Predictions::on_device(&labels, &Device::Cpu).unwrap();
        assert!(matches!(predictions, Predictions::Device(ref t) if t.rank() == 1));
        assert_eq!(predictions.into_host().unwrap(), labels);
    }

    #[test]
    fn test_device_predictions_rank2() {
        let labels = vec![Label::Multi(vec![1, 0]), Label::Multi(vec![1, 1])];
        let predictions = Predictions::on_device(&labels, &Device::Cpu).unwrap();
        assert_eq!(predictions.into_host().unwrap(), labels);
    }

    #[test]
    fn test_float_device_predictions_are_truncated_to_ids() {
        let tensor = Tensor::new(&[1.0f32, 0.0, 1.0], &Device::Cpu).unwrap();
        let labels = Predictions::Device(tensor).into_host().unwrap();
        assert_eq!(
            labels,
            vec![Label::Single(1), Label::Single(0), Label::Single(1)]
        );
    }

    #[test]
    fn test_mixed_predictions_rejected() {
        let labels = vec![Label::Single(0), Label::Multi(vec![1])];
        assert!(Predictions::on_device(&labels, &Device::Cpu).is_err());
    }

    #[test]
    fn test_rank3_predictions_rejected() {
        let tensor = Tensor::zeros((1, 1, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(Predictions::Device(tensor).into_host().is_err());
    }

    #[test]
    fn test_should_log() {
        let mut params = BodyFitParams {
            epochs: 1,
            learning_rate: 2e-5,
            warmup_steps: 0,
            use_amp: false,
            show_progress_bar: false,
            log_steps: 0,
        };
        assert!(!params.should_log(1, 3));
        assert!(params.should_log(3, 3));

        params.log_steps = 2;
        assert!(params.should_log(2, 5));
        assert!(!params.should_log(3, 5));
    }

    #[test]
    fn test_push_options_default_message() {
        assert_eq!(PushOptions::default().commit_message, "Add SetFit model");
    }

    #[test]
    fn test_model_init_none_is_error() {
        use rand::SeedableRng;

        let init = ModelInit::plain(|_| None);
        let mut rng = SeededRng::seed_from_u64(0);
        assert!(!init.takes_params());
        assert!(matches!(
            init.build(None, &mut rng),
            Err(SetFitError::ModelInit(_))
        ));
    }
}
