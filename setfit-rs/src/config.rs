//! Configuration parsing and validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dataset::ColumnMapping;
use crate::error::{Result, SetFitError};
use crate::metrics::{self, MetricKwargs};
use crate::model::MultiTargetStrategy;
use crate::search::ParamValue;

/// Contrastive objective used to fine-tune the embedding body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossKind {
    /// Pairwise cosine-similarity regression over generated pairs.
    #[default]
    CosineSimilarity,
    /// Mean over every valid triplet in the batch.
    BatchAllTriplet,
    /// Hardest positive against hardest negative per anchor.
    BatchHardTriplet,
    /// Closest negative that is still farther than the positive.
    BatchSemiHardTriplet,
    /// Batch-hard with a soft margin, `ln(1 + exp(d_ap - d_an))`.
    BatchHardSoftMarginTriplet,
    /// Supervised contrastive loss (temperature 0.07).
    SupervisedContrastive,
}

impl LossKind {
    /// Every loss kind, in declaration order.
    pub const ALL: [LossKind; 6] = [
        LossKind::CosineSimilarity,
        LossKind::BatchAllTriplet,
        LossKind::BatchHardTriplet,
        LossKind::BatchSemiHardTriplet,
        LossKind::BatchHardSoftMarginTriplet,
        LossKind::SupervisedContrastive,
    ];

    /// Canonical name, as written in config files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LossKind::CosineSimilarity => "cosine-similarity",
            LossKind::BatchAllTriplet => "batch-all-triplet",
            LossKind::BatchHardTriplet => "batch-hard-triplet",
            LossKind::BatchSemiHardTriplet => "batch-semi-hard-triplet",
            LossKind::BatchHardSoftMarginTriplet => "batch-hard-soft-margin-triplet",
            LossKind::SupervisedContrastive => "supervised-contrastive",
        }
    }

    /// Whether this loss trains on label-grouped batches instead of
    /// generated pairs.
    #[must_use]
    pub fn uses_label_grouping(self) -> bool {
        !matches!(self, LossKind::CosineSimilarity)
    }

    /// Class-style alias accepted by [`FromStr`] next to the canonical name.
    fn alias(self) -> &'static str {
        match self {
            LossKind::CosineSimilarity => "CosineSimilarityLoss",
            LossKind::BatchAllTriplet => "BatchAllTripletLoss",
            LossKind::BatchHardTriplet => "BatchHardTripletLoss",
            LossKind::BatchSemiHardTriplet => "BatchSemiHardTripletLoss",
            LossKind::BatchHardSoftMarginTriplet => "BatchHardSoftMarginTripletLoss",
            LossKind::SupervisedContrastive => "SupConLoss",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = SetFitError;

    fn from_str(s: &str) -> Result<Self> {
        LossKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || kind.alias().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                SetFitError::Config(format!(
                    "unsupported loss '{s}', expected one of: {}",
                    LossKind::ALL.map(LossKind::as_str).join(", ")
                ))
            })
    }
}

/// Distance between two embeddings used by the triplet losses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`.
    #[default]
    Cosine,
    /// `||a - b||_2`.
    Euclidean,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => f.write_str("cosine"),
            DistanceMetric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = SetFitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" | "cosine_distance" => Ok(DistanceMetric::Cosine),
            "euclidean" | "euclidean_distance" => Ok(DistanceMetric::Euclidean),
            _ => Err(SetFitError::Config(format!(
                "unknown distance metric '{s}', expected cosine or euclidean"
            ))),
        }
    }
}

/// Training hyperparameters shared by both phases.
///
/// # Example
///
/// ```rust
/// use setfit_rs::TrainingArguments;
/// use setfit_rs::config::LossKind;
///
/// let args = TrainingArguments {
///     num_iterations: 5,
///     loss: Some(LossKind::BatchHardTriplet),
///     ..Default::default()
/// };
///
/// assert!(args.validate().is_ok());
/// assert_eq!(args.batch_size, 16);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    /// Pair-generation passes over the training set.
    #[serde(default = "default_num_iterations")]
    pub num_iterations: usize,

    /// Number of training epochs.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,

    /// Learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Learning rate for the body when a differentiable head is trained.
    #[serde(default)]
    pub body_learning_rate: Option<f64>,

    /// L2 weight for a differentiable head.
    #[serde(default)]
    pub l2_weight: Option<f64>,

    /// Maximum token length handed to the head.
    #[serde(default)]
    pub max_length: Option<usize>,

    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Fraction of total optimizer steps spent warming up, in `[0, 1]`.
    #[serde(default = "default_warmup_proportion")]
    pub warmup_proportion: f64,

    /// Triplet margin.
    #[serde(default = "default_margin")]
    pub margin: f64,

    /// Consecutive samples drawn per label by the label-grouped sampler.
    #[serde(default = "default_samples_per_label")]
    pub samples_per_label: usize,

    /// Distance used by the triplet losses.
    #[serde(default)]
    pub distance_metric: DistanceMetric,

    /// Loss kind. `None` falls back to cosine similarity with a warning.
    #[serde(default = "default_loss")]
    pub loss: Option<LossKind>,

    /// Use automatic mixed precision in the body fit.
    #[serde(default)]
    pub use_amp: bool,

    /// Dataset column renames applied before training and evaluation.
    #[serde(default)]
    pub column_mapping: Option<ColumnMapping>,
}

fn default_num_iterations() -> usize {
    20
}
fn default_num_epochs() -> usize {
    1
}
fn default_learning_rate() -> f64 {
    2e-5
}
fn default_batch_size() -> usize {
    16
}
fn default_seed() -> u64 {
    42
}
fn default_warmup_proportion() -> f64 {
    0.1
}
fn default_margin() -> f64 {
    0.25
}
fn default_samples_per_label() -> usize {
    2
}
#[allow(clippy::unnecessary_wraps)]
fn default_loss() -> Option<LossKind> {
    Some(LossKind::CosineSimilarity)
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            num_iterations: default_num_iterations(),
            num_epochs: default_num_epochs(),
            learning_rate: default_learning_rate(),
            body_learning_rate: None,
            l2_weight: None,
            max_length: None,
            batch_size: default_batch_size(),
            seed: default_seed(),
            warmup_proportion: default_warmup_proportion(),
            margin: default_margin(),
            samples_per_label: default_samples_per_label(),
            distance_metric: DistanceMetric::Cosine,
            loss: default_loss(),
            use_amp: false,
            column_mapping: None,
        }
    }
}

/// Names accepted by [`TrainingArguments::set_hyperparameter`].
pub const HYPERPARAMETER_NAMES: &[&str] = &[
    "num_iterations",
    "num_epochs",
    "learning_rate",
    "body_learning_rate",
    "l2_weight",
    "max_length",
    "batch_size",
    "seed",
    "warmup_proportion",
    "margin",
    "samples_per_label",
    "distance_metric",
    "loss",
    "use_amp",
];

impl TrainingArguments {
    /// Validate the arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when `warmup_proportion` lies outside
    /// `[0, 1]` or a size parameter is zero.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.warmup_proportion) {
            return Err(SetFitError::Config(format!(
                "warmup_proportion must be greater than or equal to 0.0 and less than or equal to 1.0, got {}",
                self.warmup_proportion
            )));
        }

        if self.batch_size == 0 {
            return Err(SetFitError::Config("batch_size must be > 0".into()));
        }

        if self.samples_per_label == 0 {
            return Err(SetFitError::Config("samples_per_label must be > 0".into()));
        }

        Ok(())
    }

    /// Loss kind, substituting the default (with a warning) when unset.
    pub fn loss_or_default(&mut self) -> LossKind {
        *self.loss.get_or_insert_with(|| {
            tracing::warn!(
                "No `loss` was set, defaulting to `{}`",
                LossKind::CosineSimilarity
            );
            LossKind::CosineSimilarity
        })
    }

    /// Set one hyperparameter by name, coercing `value` to the field's type.
    ///
    /// Returns `Ok(false)` when `name` is not a training argument.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when the value cannot be coerced, or
    /// when the new value fails validation.
    ///
    /// # Example
    ///
    /// ```rust
    /// use setfit_rs::TrainingArguments;
    /// use setfit_rs::search::ParamValue;
    ///
    /// # fn main() -> setfit_rs::Result<()> {
    /// let mut args = TrainingArguments::default();
    /// assert!(args.set_hyperparameter("learning_rate", &ParamValue::from("0.01"))?);
    /// assert_eq!(args.learning_rate, 0.01);
    /// assert!(!args.set_hyperparameter("dropout", &ParamValue::Float(0.1))?);
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_hyperparameter(&mut self, name: &str, value: &ParamValue) -> Result<bool> {
        match name {
            "num_iterations" => self.num_iterations = value.to_usize(name)?,
            "num_epochs" => self.num_epochs = value.to_usize(name)?,
            "learning_rate" => self.learning_rate = value.to_f64(name)?,
            "body_learning_rate" => self.body_learning_rate = Some(value.to_f64(name)?),
            "l2_weight" => self.l2_weight = Some(value.to_f64(name)?),
            "max_length" => self.max_length = Some(value.to_usize(name)?),
            "batch_size" => self.batch_size = value.to_usize(name)?,
            "seed" => self.seed = value.to_u64(name)?,
            "warmup_proportion" => self.warmup_proportion = value.to_f64(name)?,
            "margin" => self.margin = value.to_f64(name)?,
            "samples_per_label" => self.samples_per_label = value.to_usize(name)?,
            "distance_metric" => self.distance_metric = value.to_text(name)?.parse()?,
            "loss" => self.loss = Some(value.to_text(name)?.parse()?),
            "use_amp" => self.use_amp = value.to_bool(name)?,
            _ => return Ok(false),
        }
        self.validate()?;
        Ok(true)
    }
}

/// Top-level configuration file for the `setfit` binary.
///
/// # Example
///
/// ```rust
/// use setfit_rs::SetFitConfig;
///
/// # fn main() -> setfit_rs::Result<()> {
/// let config = SetFitConfig::from_preset("batch-hard")?;
/// config.validate()?;
/// assert_eq!(config.metric, "accuracy");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetFitConfig {
    /// Training split (JSONL file with one example per line).
    #[serde(default)]
    pub train_dataset: Option<String>,

    /// Evaluation split (JSONL).
    #[serde(default)]
    pub eval_dataset: Option<String>,

    /// Named metric used by `evaluate`.
    #[serde(default = "default_metric")]
    pub metric: String,

    /// Keyword arguments forwarded to the metric.
    #[serde(default)]
    pub metric_kwargs: MetricKwargs,

    /// Multi-target strategy of the classification head, if multi-label.
    #[serde(default)]
    pub multi_target_strategy: Option<MultiTargetStrategy>,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingArguments,
}

fn default_metric() -> String {
    "accuracy".into()
}

impl Default for SetFitConfig {
    fn default() -> Self {
        Self {
            train_dataset: None,
            eval_dataset: None,
            metric: default_metric(),
            metric_kwargs: BTreeMap::new(),
            multi_target_strategy: None,
            training: TrainingArguments::default(),
        }
    }
}

impl SetFitConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"cosine"` - pair generation with cosine-similarity loss
    /// - `"batch-hard"` - label-grouped batches with batch-hard triplet loss
    /// - `"supcon"` - label-grouped batches with supervised contrastive loss
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "cosine" => Ok(Self::cosine_preset()),
            "batch-hard" => Ok(Self::batch_hard_preset()),
            "supcon" => Ok(Self::supcon_preset()),
            _ => Err(SetFitError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Pairwise cosine-similarity preset.
    #[must_use]
    pub fn cosine_preset() -> Self {
        Self {
            train_dataset: Some("./data/train.jsonl".into()),
            eval_dataset: Some("./data/test.jsonl".into()),
            ..Default::default()
        }
    }

    /// Batch-hard triplet preset.
    #[must_use]
    pub fn batch_hard_preset() -> Self {
        Self {
            training: TrainingArguments {
                loss: Some(LossKind::BatchHardTriplet),
                num_epochs: 4,
                samples_per_label: 4,
                ..Default::default()
            },
            ..Self::cosine_preset()
        }
    }

    /// Supervised contrastive preset.
    #[must_use]
    pub fn supcon_preset() -> Self {
        Self {
            training: TrainingArguments {
                loss: Some(LossKind::SupervisedContrastive),
                num_epochs: 4,
                batch_size: 32,
                ..Default::default()
            },
            ..Self::cosine_preset()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when the training split is missing,
    /// the metric is unknown, or the training arguments are invalid.
    pub fn validate(&self) -> Result<()> {
        match self.train_dataset.as_deref() {
            None | Some("") => {
                return Err(SetFitError::Config("train_dataset is required".into()));
            }
            Some(_) => {}
        }

        if !metrics::is_known(&self.metric) {
            return Err(SetFitError::Config(format!(
                "unknown metric '{}', expected one of: {}",
                self.metric,
                metrics::NAMES.join(", ")
            )));
        }

        self.training.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_training_arguments_defaults() {
        let args = TrainingArguments::default();
        assert_eq!(args.num_iterations, 20);
        assert_eq!(args.num_epochs, 1);
        assert_eq!(args.batch_size, 16);
        assert_eq!(args.seed, 42);
        assert_eq!(args.samples_per_label, 2);
        assert_eq!(args.loss, Some(LossKind::CosineSimilarity));
        assert_eq!(args.distance_metric, DistanceMetric::Cosine);
        assert!(args.column_mapping.is_none());
    }

    #[test]
    fn test_warmup_proportion_bounds() {
        for ok in [0.0, 0.1, 0.5, 1.0] {
            let args = TrainingArguments {
                warmup_proportion: ok,
                ..Default::default()
            };
            assert!(args.validate().is_ok(), "{ok} should be accepted");
        }

        for bad in [-0.01, 1.01, 1.5, f64::NAN] {
            let args = TrainingArguments {
                warmup_proportion: bad,
                ..Default::default()
            };
            assert!(
                matches!(args.validate(), Err(SetFitError::Config(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let args = TrainingArguments {
            batch_size: 0,
            ..Default::default()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_loss_kind_parsing() {
        assert_eq!(
            "batch-hard-triplet".parse::<LossKind>().unwrap(),
            LossKind::BatchHardTriplet
        );
        assert_eq!(
            "SupConLoss".parse::<LossKind>().unwrap(),
            LossKind::SupervisedContrastive
        );
        assert_eq!(
            "cosinesimilarityloss".parse::<LossKind>().unwrap(),
            LossKind::CosineSimilarity
        );
        assert!(matches!(
            "ContrastiveLoss".parse::<LossKind>(),
            Err(SetFitError::Config(_))
        ));
    }

    #[test]
    fn test_loss_kind_grouping() {
        assert!(!LossKind::CosineSimilarity.uses_label_grouping());
        for kind in &LossKind::ALL[1..] {
            assert!(kind.uses_label_grouping(), "{kind}");
        }
    }

    #[test]
    fn test_loss_or_default_persists() {
        let mut args = TrainingArguments {
            loss: None,
            ..Default::default()
        };
        assert_eq!(args.loss_or_default(), LossKind::CosineSimilarity);
        assert_eq!(args.loss, Some(LossKind::CosineSimilarity));
    }

    #[test]
    fn test_unknown_loss_in_yaml_fails_to_parse() {
        let yaml = "loss: contrastive\n";
        assert!(serde_yaml::from_str::<TrainingArguments>(yaml).is_err());
    }

    #[test]
    fn test_null_loss_in_yaml() {
        let args: TrainingArguments = serde_yaml::from_str("loss: null\n").unwrap();
        assert!(args.loss.is_none());
    }

    #[test]
    fn test_distance_metric_parsing() {
        assert_eq!(
            "Euclidean".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::Euclidean
        );
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_set_hyperparameter_coerces_strings() {
        let mut args = TrainingArguments::default();
        assert!(args
            .set_hyperparameter("learning_rate", &ParamValue::from("0.01"))
            .unwrap());
        assert!((args.learning_rate - 0.01).abs() < f64::EPSILON);

        assert!(args
            .set_hyperparameter("num_epochs", &ParamValue::Float(3.0))
            .unwrap());
        assert_eq!(args.num_epochs, 3);

        assert!(args
            .set_hyperparameter("loss", &ParamValue::from("batch-all-triplet"))
            .unwrap());
        assert_eq!(args.loss, Some(LossKind::BatchAllTriplet));
    }

    #[test]
    fn test_set_hyperparameter_unknown_name() {
        let mut args = TrainingArguments::default();
        let before = args.clone();
        assert!(!args
            .set_hyperparameter("dropout", &ParamValue::Float(0.1))
            .unwrap());
        assert_eq!(args, before);
    }

    #[test]
    fn test_set_hyperparameter_rejects_bad_values() {
        let mut args = TrainingArguments::default();
        assert!(args
            .set_hyperparameter("batch_size", &ParamValue::from("lots"))
            .is_err());
        assert!(args
            .set_hyperparameter("warmup_proportion", &ParamValue::Float(2.0))
            .is_err());
    }

    #[test]
    fn test_every_hyperparameter_name_is_settable() {
        for name in HYPERPARAMETER_NAMES {
            let mut args = TrainingArguments::default();
            let value = match *name {
                "distance_metric" => ParamValue::from("euclidean"),
                "loss" => ParamValue::from("batch-hard-triplet"),
                "use_amp" => ParamValue::Bool(true),
                "warmup_proportion" => ParamValue::Float(0.5),
                _ => ParamValue::Int(4),
            };
            assert!(args.set_hyperparameter(name, &value).unwrap(), "{name}");
        }
    }

    #[test]
    fn test_config_serialization() {
        let config = SetFitConfig::batch_hard_preset();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: SetFitConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_presets() {
        assert!(SetFitConfig::from_preset("cosine").is_ok());
        assert!(SetFitConfig::from_preset("batch-hard").is_ok());
        assert_eq!(
            SetFitConfig::from_preset("supcon").unwrap().training.loss,
            Some(LossKind::SupervisedContrastive)
        );
        assert!(SetFitConfig::from_preset("invalid").is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SetFitConfig::cosine_preset();
        assert!(config.validate().is_ok());

        config.metric = "bleu".into();
        assert!(config.validate().is_err());

        config.metric = "f1".into();
        config.train_dataset = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
train_dataset: ./data/sst2.jsonl
metric: f1
metric_kwargs:
  average: macro
training:
  num_iterations: 5
  loss: batch-semi-hard-triplet
  distance_metric: euclidean
  column_mapping:
    sentence: text
    polarity: label
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let config = SetFitConfig::from_file(file.path()).unwrap();

        assert_eq!(config.train_dataset.as_deref(), Some("./data/sst2.jsonl"));
        assert_eq!(config.metric, "f1");
        assert_eq!(config.training.num_iterations, 5);
        assert_eq!(config.training.loss, Some(LossKind::BatchSemiHardTriplet));
        assert_eq!(config.training.distance_metric, DistanceMetric::Euclidean);
        assert_eq!(config.training.batch_size, 16);
        let mapping = config.training.column_mapping.unwrap();
        assert_eq!(mapping.get("sentence").map(String::as_str), Some("text"));
    }

    #[test]
    fn test_config_to_file_round_trip() {
        let config = SetFitConfig::supcon_preset();
        let file = NamedTempFile::new().unwrap();
        config.to_file(file.path()).unwrap();
        assert_eq!(SetFitConfig::from_file(file.path()).unwrap(), config);
    }
}
