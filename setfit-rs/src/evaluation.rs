//! Validation loss during the body fit and metric dispatch after training.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::loss::{loss_value, LossObjective};
use crate::metrics::{self, MetricKwargs, Metrics};
use crate::model::{EmbeddingBody, Label};
use crate::sampler::DataLoader;

/// Averages the training objective over a held-out loader.
pub struct ValidationLossEvaluator {
    loader: DataLoader,
    loss: Arc<dyn LossObjective>,
}

impl ValidationLossEvaluator {
    /// Evaluate `loss` over `loader`.
    #[must_use]
    pub fn new(loader: DataLoader, loss: Arc<dyn LossObjective>) -> Self {
        Self { loader, loss }
    }

    /// Batches per evaluation.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.loader.num_batches()
    }

    /// Mean loss over one pass of the loader; `0.0` when it yields no batch.
    ///
    /// # Errors
    ///
    /// Propagates loss computation errors.
    pub fn evaluate(&mut self, body: &dyn EmbeddingBody) -> Result<f64> {
        let batches = self.loader.epoch_batches();
        if batches.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for batch in &batches {
            total += loss_value(&self.loss.compute(body, batch)?)?;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = total / batches.len() as f64;
        tracing::debug!("Validation {}: {mean:.6}", self.loss.name());
        Ok(mean)
    }
}

impl fmt::Debug for ValidationLossEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationLossEvaluator")
            .field("loss", &self.loss.name())
            .field("num_batches", &self.num_batches())
            .finish()
    }
}

/// Caller-supplied metric: `(predictions, references) -> metrics`.
pub type MetricFn = Box<dyn Fn(&[Label], &[Label]) -> Metrics>;

/// How `evaluate` scores predictions.
pub enum Metric {
    /// A built-in metric from [`crate::metrics`].
    Named(String),
    /// A caller-supplied function.
    Callable(MetricFn),
}

impl Metric {
    /// Wrap a function.
    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(&[Label], &[Label]) -> Metrics + 'static,
    {
        Metric::Callable(Box::new(f))
    }

    /// Score `predictions` against `references`.
    ///
    /// Named metrics receive `kwargs` and the multi-label configuration when
    /// `multilabel` is set; callables receive neither.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown metric names or bad kwargs.
    pub fn compute(
        &self,
        predictions: &[Label],
        references: &[Label],
        multilabel: bool,
        kwargs: &MetricKwargs,
    ) -> Result<Metrics> {
        match self {
            Metric::Named(name) => {
                metrics::compute(name, predictions, references, multilabel, kwargs)
            }
            Metric::Callable(f) => Ok(f(predictions, references)),
        }
    }
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Named("accuracy".into())
    }
}

impl From<&str> for Metric {
    fn from(name: &str) -> Self {
        Metric::Named(name.to_string())
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Metric::Callable(_) => f.write_str("Callable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SetFitError;
    use crate::loss::CosineSimilarityLoss;
    use crate::mocks::MockBody;
    use crate::model::SeededRng;
    use crate::pairs::ContrastivePair;
    use rand::SeedableRng;

    fn pairs() -> Vec<ContrastivePair> {
        vec![
            ContrastivePair {
                anchor: "great film".into(),
                other: "great film".into(),
                target: 1.0,
            },
            ContrastivePair {
                anchor: "great film".into(),
                other: "dull plot".into(),
                target: 0.0,
            },
            ContrastivePair {
                anchor: "dull plot".into(),
                other: "dull plot".into(),
                target: 1.0,
            },
        ]
    }

    #[test]
    fn test_validation_loss_is_mean_over_batches() {
        let loader = DataLoader::pairs(pairs(), 2, SeededRng::seed_from_u64(0));
        let mut evaluator = ValidationLossEvaluator::new(loader, Arc::new(CosineSimilarityLoss));
        assert_eq!(evaluator.num_batches(), 2);

        let score = evaluator.evaluate(&MockBody::default()).unwrap();
        assert!(score.is_finite());
        assert!(score >= 0.0);
    }

    #[test]
    fn test_empty_loader_scores_zero() {
        let loader = DataLoader::pairs(Vec::new(), 4, SeededRng::seed_from_u64(0));
        let mut evaluator = ValidationLossEvaluator::new(loader, Arc::new(CosineSimilarityLoss));
        assert_eq!(evaluator.evaluate(&MockBody::default()).unwrap(), 0.0);
    }

    #[test]
    fn test_named_metric() {
        let labels = vec![Label::Single(0), Label::Single(1)];
        let metrics = Metric::default()
            .compute(&labels, &labels, false, &MetricKwargs::new())
            .unwrap();
        assert_eq!(metrics.get("accuracy"), Some(&1.0));
    }

    #[test]
    fn test_unknown_named_metric() {
        let labels = vec![Label::Single(0)];
        assert!(matches!(
            Metric::from("rouge").compute(&labels, &labels, false, &MetricKwargs::new()),
            Err(SetFitError::Config(_))
        ));
    }

    #[test]
    fn test_callable_metric() {
        let metric = Metric::callable(|preds, refs| {
            Metrics::from([("n".to_string(), (preds.len() + refs.len()) as f64)])
        });
        let labels = vec![Label::Single(0); 3];
        let metrics = metric
            .compute(&labels, &labels, true, &MetricKwargs::new())
            .unwrap();
        assert_eq!(metrics["n"], 6.0);
    }
}
