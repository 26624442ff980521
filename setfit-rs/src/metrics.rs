//! Named classification metrics.
//!
//! Supported names are `accuracy`, `f1`, `precision`, `recall` and
//! `matthews_correlation`. Each returns a single-entry map keyed by its name.
//!
//! Keyword arguments:
//! - `average`: `"binary"` (default), `"micro"`, `"macro"` or `"weighted"`
//!   for f1/precision/recall
//! - `pos_label`: positive class for `average = "binary"` (default `1`)
//! - `normalize`: `false` makes `accuracy` return a count

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{Result, SetFitError};
use crate::model::Label;

/// Metric name to value.
pub type Metrics = BTreeMap<String, f64>;

/// Keyword arguments forwarded to a named metric.
pub type MetricKwargs = BTreeMap<String, Value>;

/// Names [`compute`] understands.
pub const NAMES: &[&str] = &[
    "accuracy",
    "f1",
    "precision",
    "recall",
    "matthews_correlation",
];

/// Whether `name` is a supported metric.
#[must_use]
pub fn is_known(name: &str) -> bool {
    NAMES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Average {
    Binary,
    Micro,
    Macro,
    Weighted,
}

impl Average {
    fn from_kwargs(kwargs: &MetricKwargs) -> Result<Self> {
        match kwargs.get("average") {
            None => Ok(Average::Binary),
            Some(Value::String(s)) => match s.as_str() {
                "binary" => Ok(Average::Binary),
                "micro" => Ok(Average::Micro),
                "macro" => Ok(Average::Macro),
                "weighted" => Ok(Average::Weighted),
                other => Err(SetFitError::Config(format!("unknown average '{other}'"))),
            },
            Some(other) => Err(SetFitError::Config(format!(
                "average must be a string, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ClassCounts {
    tp: f64,
    fp: f64,
    fn_: f64,
    support: f64,
}

impl ClassCounts {
    fn add(&mut self, other: ClassCounts) {
        self.tp += other.tp;
        self.fp += other.fp;
        self.fn_ += other.fn_;
        self.support += other.support;
    }

    fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    fn f1(&self) -> f64 {
        ratio(2.0 * self.tp, 2.0 * self.tp + self.fp + self.fn_)
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Per-class confusion counts, keyed by class id.
fn class_counts(predictions: &[Label], references: &[Label], multilabel: bool) -> BTreeMap<i64, ClassCounts> {
    let mut counts: BTreeMap<i64, ClassCounts> = BTreeMap::new();
    for (pred, truth) in predictions.iter().zip(references) {
        if multilabel {
            let predicted: BTreeSet<i64> = pred.active_classes().into_iter().collect();
            let actual: BTreeSet<i64> = truth.active_classes().into_iter().collect();
            let width = multi_width(pred).max(multi_width(truth));
            for class in 0..width {
                counts.entry(class).or_default();
            }
            for class in predicted.union(&actual) {
                let entry = counts.entry(*class).or_default();
                match (predicted.contains(class), actual.contains(class)) {
                    (true, true) => entry.tp += 1.0,
                    (true, false) => entry.fp += 1.0,
                    (false, true) => entry.fn_ += 1.0,
                    (false, false) => {}
                }
                if actual.contains(class) {
                    entry.support += 1.0;
                }
            }
        } else {
            let (Some(p), Some(t)) = (pred.active_classes().first().copied(), truth.active_classes().first().copied()) else {
                continue;
            };
            if p == t {
                counts.entry(p).or_default().tp += 1.0;
            } else {
                counts.entry(p).or_default().fp += 1.0;
                counts.entry(t).or_default().fn_ += 1.0;
            }
            counts.entry(t).or_default().support += 1.0;
        }
    }
    counts
}

fn multi_width(label: &Label) -> i64 {
    match label {
        Label::Multi(bits) => i64::try_from(bits.len()).unwrap_or(i64::MAX),
        Label::Single(id) => id + 1,
    }
}

fn averaged(
    counts: &BTreeMap<i64, ClassCounts>,
    average: Average,
    pos_label: i64,
    multilabel: bool,
    score: fn(&ClassCounts) -> f64,
) -> Result<f64> {
    match average {
        Average::Binary => {
            if multilabel || counts.len() > 2 {
                return Err(SetFitError::Config(
                    "target is multiclass or multilabel but average='binary'; \
                     choose one of micro, macro or weighted"
                        .into(),
                ));
            }
            if counts.len() == 2 && !counts.contains_key(&pos_label) {
                let labels: Vec<String> = counts.keys().map(ToString::to_string).collect();
                return Err(SetFitError::Config(format!(
                    "pos_label={pos_label} is not a valid label; labels are [{}]",
                    labels.join(", ")
                )));
            }
            Ok(counts.get(&pos_label).map_or(0.0, score))
        }
        Average::Micro => {
            let mut total = ClassCounts::default();
            for c in counts.values() {
                total.add(*c);
            }
            Ok(score(&total))
        }
        Average::Macro => {
            #[allow(clippy::cast_precision_loss)]
            let n = counts.len() as f64;
            Ok(ratio(counts.values().map(score).sum(), n))
        }
        Average::Weighted => {
            let support: f64 = counts.values().map(|c| c.support).sum();
            Ok(ratio(
                counts.values().map(|c| score(c) * c.support).sum(),
                support,
            ))
        }
    }
}

fn accuracy(predictions: &[Label], references: &[Label], kwargs: &MetricKwargs) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let correct = predictions
        .iter()
        .zip(references)
        .filter(|(p, t)| p == t)
        .count() as f64;
    match kwargs.get("normalize") {
        Some(Value::Bool(false)) => correct,
        #[allow(clippy::cast_precision_loss)]
        _ => ratio(correct, predictions.len() as f64),
    }
}

/// Multiclass Matthews correlation (Gorodkin's R_K).
fn matthews(counts: &BTreeMap<i64, ClassCounts>, samples: f64) -> f64 {
    let correct: f64 = counts.values().map(|c| c.tp).sum();
    let predicted = |c: &ClassCounts| c.tp + c.fp;
    let actual = |c: &ClassCounts| c.tp + c.fn_;

    let cov_ytyp = correct * samples - counts.values().map(|c| predicted(c) * actual(c)).sum::<f64>();
    let cov_ypyp = samples * samples - counts.values().map(|c| predicted(c).powi(2)).sum::<f64>();
    let cov_ytyt = samples * samples - counts.values().map(|c| actual(c).powi(2)).sum::<f64>();
    ratio(cov_ytyp, (cov_ypyp * cov_ytyt).sqrt())
}

fn binary_matthews(c: &ClassCounts, samples: f64) -> f64 {
    let tn = samples - c.tp - c.fp - c.fn_;
    let num = c.tp * tn - c.fp * c.fn_;
    let den = ((c.tp + c.fp) * (c.tp + c.fn_) * (tn + c.fp) * (tn + c.fn_)).sqrt();
    ratio(num, den)
}

/// Compute a named metric.
///
/// `multilabel` selects the multi-hot interpretation of the labels.
///
/// # Errors
///
/// Returns [`SetFitError::Config`] for unknown names, malformed keyword
/// arguments, an averaging mode that does not fit the targets, or inputs of
/// different lengths.
///
/// # Example
///
/// ```rust
/// use setfit_rs::metrics::{compute, MetricKwargs};
/// use setfit_rs::model::Label;
///
/// # fn main() -> setfit_rs::Result<()> {
/// let preds = vec![Label::Single(1), Label::Single(0), Label::Single(1)];
/// let refs = vec![Label::Single(1), Label::Single(1), Label::Single(1)];
///
/// let metrics = compute("accuracy", &preds, &refs, false, &MetricKwargs::new())?;
/// assert!((metrics["accuracy"] - 2.0 / 3.0).abs() < 1e-12);
/// # Ok(())
/// # }
/// ```
pub fn compute(
    name: &str,
    predictions: &[Label],
    references: &[Label],
    multilabel: bool,
    kwargs: &MetricKwargs,
) -> Result<Metrics> {
    if predictions.len() != references.len() {
        return Err(SetFitError::Config(format!(
            "got {} predictions for {} references",
            predictions.len(),
            references.len()
        )));
    }

    let pos_label = match kwargs.get("pos_label") {
        None => 1,
        Some(value) => value.as_i64().ok_or_else(|| {
            SetFitError::Config(format!("pos_label must be an integer, got {value}"))
        })?,
    };

    let value = match name {
        "accuracy" => accuracy(predictions, references, kwargs),
        "f1" | "precision" | "recall" => {
            let average = Average::from_kwargs(kwargs)?;
            let counts = class_counts(predictions, references, multilabel);
            let score: fn(&ClassCounts) -> f64 = match name {
                "f1" => ClassCounts::f1,
                "precision" => ClassCounts::precision,
                _ => ClassCounts::recall,
            };
            averaged(&counts, average, pos_label, multilabel, score)?
        }
        "matthews_correlation" => {
            let counts = class_counts(predictions, references, multilabel);
            #[allow(clippy::cast_precision_loss)]
            let samples = predictions.len() as f64;
            if multilabel {
                #[allow(clippy::cast_precision_loss)]
                let n = counts.len() as f64;
                ratio(
                    counts.values().map(|c| binary_matthews(c, samples)).sum(),
                    n,
                )
            } else {
                matthews(&counts, samples)
            }
        }
        _ => {
            return Err(SetFitError::Config(format!(
                "unknown metric '{name}', expected one of: {}",
                NAMES.join(", ")
            )))
        }
    };

    Ok(Metrics::from([(name.to_string(), value)]))
}
