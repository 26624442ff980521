//! Deterministic in-crate model for testing without a real embedding network.
//!
//! [`MockBody`] encodes texts as hashed bag-of-words vectors and [`MockModel`]
//! puts a nearest-centroid head on top. Neither learns from the contrastive
//! fit, but both drive the loaders, losses and listeners exactly as a real
//! model would.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use candle_core::{Device, Tensor};

use crate::error::{Result, SetFitError};
use crate::history::{EvalStep, TrainStep, TrainingListener};
use crate::loss::loss_value;
use crate::model::{
    BodyFitParams, BodyObjective, EmbeddingBody, HeadFitArgs, Label, ModelPart,
    MultiTargetStrategy, Predictions, PushOptions, SetFitModel,
};

/// Hashed bag-of-words encoder.
#[derive(Debug, Clone)]
pub struct MockBody {
    dim: usize,
    steps_taken: usize,
}

impl MockBody {
    /// Encoder producing `dim`-wide embeddings.
    ///
    /// # Panics
    ///
    /// Panics if `dim` is zero.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        assert!(dim > 0, "embedding dimension must be > 0");
        Self { dim, steps_taken: 0 }
    }

    /// Embedding width.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Optimizer steps taken across all fits.
    #[must_use]
    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Unit-length embedding of one text.
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![1e-3_f32; self.dim];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            #[allow(clippy::cast_possible_truncation)]
            let bucket = (hasher.finish() % self.dim as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        vector.iter_mut().for_each(|x| *x /= norm);
        vector
    }
}

impl Default for MockBody {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EmbeddingBody for MockBody {
    fn encode(&self, texts: &[String]) -> Result<Tensor> {
        let data: Vec<f32> = texts.iter().flat_map(|t| self.embed(t)).collect();
        Ok(Tensor::from_vec(data, (texts.len(), self.dim), &Device::Cpu)?)
    }

    fn fit(
        &mut self,
        mut objective: BodyObjective<'_>,
        params: &BodyFitParams,
        listener: &mut dyn TrainingListener,
    ) -> Result<()> {
        let mut scheduler = params.scheduler(objective.loader.num_batches());

        for epoch in 0..params.epochs {
            let batches = objective.loader.epoch_batches();
            let steps = batches.len();
            for (i, batch) in batches.iter().enumerate() {
                let learning_rate = scheduler.step();
                let loss = loss_value(&objective.loss.compute(&*self, batch)?)?;
                self.steps_taken += 1;
                if params.should_log(i + 1, steps) {
                    listener.on_train_step(TrainStep {
                        objective_index: 0,
                        epoch,
                        step: i + 1,
                        learning_rate,
                        loss,
                    });
                }
            }

            if let Some(evaluator) = objective.evaluator.as_mut() {
                let score = evaluator.evaluate(&*self)?;
                listener.on_eval_step(EvalStep {
                    epoch,
                    step: steps,
                    loss: score,
                });
            }
        }
        Ok(())
    }
}

/// [`MockBody`] with a nearest-centroid head.
#[derive(Debug, Clone, Default)]
pub struct MockModel {
    body: MockBody,
    differentiable: bool,
    strategy: Option<MultiTargetStrategy>,
    head_frozen: bool,
    body_frozen: bool,
    centroids: Vec<(Label, Vec<f32>)>,
}

impl MockModel {
    /// Report a differentiable head.
    #[must_use]
    pub fn differentiable(mut self) -> Self {
        self.differentiable = true;
        self
    }

    /// Report a multi-target strategy.
    #[must_use]
    pub fn with_multi_target_strategy(mut self, strategy: MultiTargetStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Whether the head has been fitted.
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn nearest(&self, embedding: &[f32]) -> Option<&Label> {
        self.centroids
            .iter()
            .map(|(label, centroid)| {
                let distance: f32 = centroid
                    .iter()
                    .zip(embedding)
                    .map(|(c, e)| (c - e) * (c - e))
                    .sum();
                (label, distance)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(label, _)| label)
    }

    fn classify(&self, texts: &[String]) -> Result<Vec<Label>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.body.encode(texts)?.to_vec2::<f32>()?;
        embeddings
            .iter()
            .map(|e| {
                self.nearest(e)
                    .cloned()
                    .ok_or_else(|| SetFitError::Model("head is not fitted".into()))
            })
            .collect()
    }

    fn error_rate(&self, texts: &[String], labels: &[Label]) -> Result<f64> {
        if texts.is_empty() {
            return Ok(0.0);
        }
        let predictions = self.classify(texts)?;
        let wrong = predictions.iter().zip(labels).filter(|(p, l)| p != l).count();
        #[allow(clippy::cast_precision_loss)]
        Ok(wrong as f64 / texts.len() as f64)
    }
}

impl SetFitModel for MockModel {
    fn body(&self) -> &dyn EmbeddingBody {
        &self.body
    }

    fn body_mut(&mut self) -> &mut dyn EmbeddingBody {
        &mut self.body
    }

    fn has_differentiable_head(&self) -> bool {
        self.differentiable
    }

    fn multi_target_strategy(&self) -> Option<MultiTargetStrategy> {
        self.strategy
    }

    fn freeze(&mut self, part: ModelPart) {
        match part {
            ModelPart::Head => self.head_frozen = true,
            ModelPart::Body => self.body_frozen = true,
        }
    }

    fn unfreeze(&mut self, part: ModelPart) {
        match part {
            ModelPart::Head => self.head_frozen = false,
            ModelPart::Body => self.body_frozen = false,
        }
    }

    fn is_frozen(&self, part: ModelPart) -> bool {
        match part {
            ModelPart::Head => self.head_frozen,
            ModelPart::Body => self.body_frozen,
        }
    }

    fn fit(&mut self, args: &HeadFitArgs<'_>, listener: &mut dyn TrainingListener) -> Result<()> {
        if args.x_train.len() != args.y_train.len() {
            return Err(SetFitError::Model(format!(
                "{} texts but {} labels",
                args.x_train.len(),
                args.y_train.len()
            )));
        }
        if args.x_train.is_empty() {
            return Err(SetFitError::Model("cannot fit a head on no examples".into()));
        }

        let embeddings = self.body.encode(args.x_train)?.to_vec2::<f32>()?;
        let mut sums: BTreeMap<&Label, (Vec<f32>, usize)> = BTreeMap::new();
        for (embedding, label) in embeddings.iter().zip(args.y_train) {
            let (sum, count) = sums
                .entry(label)
                .or_insert_with(|| (vec![0.0; embedding.len()], 0));
            sum.iter_mut().zip(embedding).for_each(|(s, e)| *s += e);
            *count += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        let centroids = sums
            .into_iter()
            .map(|(label, (sum, count))| {
                (label.clone(), sum.into_iter().map(|s| s / count as f32).collect())
            })
            .collect();
        self.centroids = centroids;

        for epoch in 0..args.num_epochs {
            let loss = self.error_rate(args.x_train, args.y_train)?;
            listener.on_train_step(TrainStep {
                objective_index: 0,
                epoch,
                step: 0,
                learning_rate: args.learning_rate,
                loss,
            });
            if let Some((x_test, y_test)) = args.eval {
                listener.on_eval_step(EvalStep {
                    epoch,
                    step: 0,
                    loss: self.error_rate(x_test, y_test)?,
                });
            }
        }
        Ok(())
    }

    fn predict(&self, texts: &[String]) -> Result<Predictions> {
        let labels = self.classify(texts)?;
        Predictions::on_device(&labels, &Device::Cpu)
    }

    fn push_to_hub(&self, repo_id: &str, options: &PushOptions) -> Result<String> {
        let branch = options.branch.as_deref().unwrap_or("main");
        tracing::info!("Pushing to {repo_id}@{branch}: {}", options.commit_message);
        Ok(format!("https://huggingface.co/{repo_id}/commit/{branch}"))
    }
}
