//! Contrastive loss objectives and loss-strategy selection.
//!
//! Every objective encodes a batch through the body and returns a scalar
//! [`Tensor`] still attached to the encodings, so the body's optimizer can
//! backpropagate through it. Triplet selection happens on the host; the
//! selected distances are gathered back out of the distance matrix with
//! `index_select` so the graph is preserved.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use rand::prelude::*;

use crate::config::{DistanceMetric, LossKind, TrainingArguments};
use crate::error::{Result, SetFitError};
use crate::model::{EmbeddingBody, Label, SeededRng};
use crate::pairs::{ContrastivePair, PairGenerator};
use crate::sampler::{Batch, DataLoader, LabelGroupedSampler, LabeledText};

/// Temperature of the supervised contrastive loss.
pub const SUPCON_TEMPERATURE: f64 = 0.07;

/// A differentiable training objective for the embedding body.
pub trait LossObjective {
    /// Display name.
    fn name(&self) -> &'static str;

    /// Loss of one batch as a rank-0 tensor.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when the batch kind does not match the
    /// objective, and encoder or candle errors.
    fn compute(&self, body: &dyn EmbeddingBody, batch: &Batch) -> Result<Tensor>;
}

/// Host value of a rank-0 loss tensor.
///
/// # Errors
///
/// Returns a candle error for tensors with more than one element.
pub fn loss_value(loss: &Tensor) -> Result<f64> {
    let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    Ok(f64::from(value))
}

/// Build the objective for `kind`.
#[must_use]
pub fn build_loss(kind: LossKind, distance: DistanceMetric, margin: f64) -> Arc<dyn LossObjective> {
    match kind {
        LossKind::CosineSimilarity => Arc::new(CosineSimilarityLoss),
        LossKind::BatchAllTriplet => Arc::new(BatchAllTripletLoss { distance, margin }),
        LossKind::BatchHardTriplet => Arc::new(BatchHardTripletLoss { distance, margin }),
        LossKind::BatchSemiHardTriplet => Arc::new(BatchSemiHardTripletLoss { distance, margin }),
        LossKind::BatchHardSoftMarginTriplet => {
            Arc::new(BatchHardSoftMarginTripletLoss { distance })
        }
        LossKind::SupervisedContrastive => Arc::new(SupConLoss::default()),
    }
}

fn pair_batch<'a>(batch: &'a Batch, loss: &str) -> Result<&'a [ContrastivePair]> {
    match batch {
        Batch::Pairs(pairs) => Ok(pairs),
        Batch::Labeled(_) => Err(SetFitError::Config(format!(
            "{loss} expects generated pairs, got a label-grouped batch"
        ))),
    }
}

fn encode_labeled<'a>(
    body: &dyn EmbeddingBody,
    batch: &'a Batch,
    loss: &str,
) -> Result<(Tensor, Vec<&'a Label>)> {
    let Batch::Labeled(items) = batch else {
        return Err(SetFitError::Config(format!(
            "{loss} expects label-grouped batches, got generated pairs"
        )));
    };
    let texts: Vec<String> = items.iter().map(|item| item.text.clone()).collect();
    let labels = items.iter().map(|item| &item.label).collect();
    Ok((body.encode(&texts)?, labels))
}

fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, 1e-12)?;
    Ok(x.broadcast_div(&norm)?)
}

/// `[n, n]` distance matrix between the rows of `embeddings`.
///
/// # Errors
///
/// Returns candle errors for non-matrix input.
pub fn pairwise_distances(embeddings: &Tensor, metric: DistanceMetric) -> Result<Tensor> {
    match metric {
        DistanceMetric::Cosine => {
            let normed = l2_normalize(embeddings)?;
            Ok(normed.matmul(&normed.t()?)?.affine(-1.0, 1.0)?)
        }
        DistanceMetric::Euclidean => {
            let dot = embeddings.matmul(&embeddings.t()?)?;
            let sq = embeddings.sqr()?.sum_keepdim(1)?;
            let squared = sq
                .broadcast_add(&sq.t()?)?
                .sub(&dot.affine(2.0, 0.0)?)?
                .relu()?;
            Ok(squared.affine(1.0, 1e-16)?.sqrt()?)
        }
    }
}

/// Zero that stays connected to `embeddings`.
fn zero_loss(embeddings: &Tensor) -> Result<Tensor> {
    Ok(embeddings.sum_all()?.affine(0.0, 0.0)?)
}

/// Entries of `matrix` at flat row-major offsets.
fn gather(matrix: &Tensor, offsets: Vec<u32>) -> Result<Tensor> {
    let len = offsets.len();
    let idx = Tensor::from_vec(offsets, len, matrix.device())?;
    Ok(matrix.flatten_all()?.index_select(&idx, 0)?)
}

#[allow(clippy::cast_possible_truncation)]
fn offset(n: usize, row: usize, col: usize) -> u32 {
    (row * n + col) as u32
}

/// Triplet-selection view of one batch.
struct TripletView<'a> {
    labels: Vec<&'a Label>,
    dist: Vec<Vec<f32>>,
}

impl<'a> TripletView<'a> {
    fn new(dist: &Tensor, labels: Vec<&'a Label>) -> Result<Self> {
        let dist = dist.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok(Self { labels, dist })
    }

    fn n(&self) -> usize {
        self.labels.len()
    }

    fn positives(&self, anchor: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.n()).filter(move |&p| p != anchor && self.labels[p] == self.labels[anchor])
    }

    fn negatives(&self, anchor: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.n()).filter(move |&m| self.labels[m] != self.labels[anchor])
    }

    /// Hardest positive and hardest negative of every anchor that has both.
    fn batch_hard(&self) -> (Vec<u32>, Vec<u32>) {
        let n = self.n();
        let mut pos = Vec::new();
        let mut neg = Vec::new();
        for a in 0..n {
            let row = &self.dist[a];
            let hardest_pos = self.positives(a).max_by(|&x, &y| row[x].total_cmp(&row[y]));
            let hardest_neg = self.negatives(a).min_by(|&x, &y| row[x].total_cmp(&row[y]));
            if let (Some(p), Some(m)) = (hardest_pos, hardest_neg) {
                pos.push(offset(n, a, p));
                neg.push(offset(n, a, m));
            }
        }
        (pos, neg)
    }
}

/// Cosine similarity regressed onto the pair target with MSE.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarityLoss;

impl LossObjective for CosineSimilarityLoss {
    fn name(&self) -> &'static str {
        "CosineSimilarityLoss"
    }

    fn compute(&self, body: &dyn EmbeddingBody, batch: &Batch) -> Result<Tensor> {
        let pairs = pair_batch(batch, self.name())?;
        let anchors: Vec<String> = pairs.iter().map(|p| p.anchor.clone()).collect();
        let others: Vec<String> = pairs.iter().map(|p| p.other.clone()).collect();
        let a = body.encode(&anchors)?;
        let b = body.encode(&others)?;

        let dot = (&a * &b)?.sum(1)?;
        let norm_a = a.sqr()?.sum(1)?.sqrt()?;
        let norm_b = b.sqr()?.sum(1)?.sqrt()?;
        let cosine = dot.div(&(norm_a * norm_b)?.affine(1.0, 1e-8)?)?;

        let targets: Vec<f32> = pairs.iter().map(|p| p.target).collect();
        let targets = Tensor::from_vec(targets, pairs.len(), a.device())?.to_dtype(cosine.dtype())?;
        Ok(cosine.sub(&targets)?.sqr()?.mean_all()?)
    }
}

/// Mean hinge loss over every valid triplet with positive loss.
#[derive(Debug, Clone, Copy)]
pub struct BatchAllTripletLoss {
    /// Distance metric.
    pub distance: DistanceMetric,
    /// Margin.
    pub margin: f64,
}

impl LossObjective for BatchAllTripletLoss {
    fn name(&self) -> &'static str {
        "BatchAllTripletLoss"
    }

    fn compute(&self, body: &dyn EmbeddingBody, batch: &Batch) -> Result<Tensor> {
        let (embeddings, labels) = encode_labeled(body, batch, self.name())?;
        let dist = pairwise_distances(&embeddings, self.distance)?;
        let view = TripletView::new(&dist, labels)?;
        let n = view.n();

        let mut pos = Vec::new();
        let mut neg = Vec::new();
        for a in 0..n {
            for p in view.positives(a) {
                for m in view.negatives(a) {
                    pos.push(offset(n, a, p));
                    neg.push(offset(n, a, m));
                }
            }
        }
        if pos.is_empty() {
            return zero_loss(&embeddings);
        }

        let losses = gather(&dist, pos)?
            .sub(&gather(&dist, neg)?)?
            .affine(1.0, self.margin)?
            .relu()?;
        #[allow(clippy::cast_precision_loss)]
        let active = losses
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .iter()
            .filter(|v| **v > 1e-16)
            .count() as f64;
        Ok(losses.sum_all()?.affine(1.0 / (active + 1e-16), 0.0)?)
    }
}

/// Hardest positive against hardest negative for every anchor.
#[derive(Debug, Clone, Copy)]
pub struct BatchHardTripletLoss {
    /// Distance metric.
    pub distance: DistanceMetric,
    /// Margin.
    pub margin: f64,
}

impl LossObjective for BatchHardTripletLoss {
    fn name(&self) -> &'static str {
        "BatchHardTripletLoss"
    }

    fn compute(&self, body: &dyn EmbeddingBody, batch: &Batch) -> Result<Tensor> {
        let (embeddings, labels) = encode_labeled(body, batch, self.name())?;
        let dist = pairwise_distances(&embeddings, self.distance)?;
        let (pos, neg) = TripletView::new(&dist, labels)?.batch_hard();
        if pos.is_empty() {
            return zero_loss(&embeddings);
        }
        Ok(gather(&dist, pos)?
            .sub(&gather(&dist, neg)?)?
            .affine(1.0, self.margin)?
            .relu()?
            .mean_all()?)
    }
}

/// For every positive pair, the closest negative farther than the positive,
/// or the farthest negative when none is.
#[derive(Debug, Clone, Copy)]
pub struct BatchSemiHardTripletLoss {
    /// Distance metric.
    pub distance: DistanceMetric,
    /// Margin.
    pub margin: f64,
}

impl LossObjective for BatchSemiHardTripletLoss {
    fn name(&self) -> &'static str {
        "BatchSemiHardTripletLoss"
    }

    fn compute(&self, body: &dyn EmbeddingBody, batch: &Batch) -> Result<Tensor> {
        let (embeddings, labels) = encode_labeled(body, batch, self.name())?;
        let dist = pairwise_distances(&embeddings, self.distance)?;
        let view = TripletView::new(&dist, labels)?;
        let n = view.n();

        let mut pos = Vec::new();
        let mut neg = Vec::new();
        for a in 0..n {
            let row = &view.dist[a];
            for p in view.positives(a) {
                let d_ap = row[p];
                let semi_hard = view
                    .negatives(a)
                    .filter(|&m| row[m] > d_ap)
                    .min_by(|&x, &y| row[x].total_cmp(&row[y]));
                let chosen = semi_hard
                    .or_else(|| view.negatives(a).max_by(|&x, &y| row[x].total_cmp(&row[y])));
                if let Some(m) = chosen {
                    pos.push(offset(n, a, p));
                    neg.push(offset(n, a, m));
                }
            }
        }
        if pos.is_empty() {
            return zero_loss(&embeddings);
        }

        Ok(gather(&dist, pos)?
            .sub(&gather(&dist, neg)?)?
            .affine(1.0, self.margin)?
            .relu()?
            .mean_all()?)
    }
}

/// Batch-hard mining with `ln(1 + exp(d_ap - d_an))` in place of the hinge.
#[derive(Debug, Clone, Copy)]
pub struct BatchHardSoftMarginTripletLoss {
    /// Distance metric.
    pub distance: DistanceMetric,
}

impl LossObjective for BatchHardSoftMarginTripletLoss {
    fn name(&self) -> &'static str {
        "BatchHardSoftMarginTripletLoss"
    }

    fn compute(&self, body: &dyn EmbeddingBody, batch: &Batch) -> Result<Tensor> {
        let (embeddings, labels) = encode_labeled(body, batch, self.name())?;
        let dist = pairwise_distances(&embeddings, self.distance)?;
        let (pos, neg) = TripletView::new(&dist, labels)?.batch_hard();
        if pos.is_empty() {
            return zero_loss(&embeddings);
        }
        Ok(gather(&dist, pos)?
            .sub(&gather(&dist, neg)?)?
            .exp()?
            .affine(1.0, 1.0)?
            .log()?
            .mean_all()?)
    }
}

/// Supervised contrastive loss over normalized embeddings.
#[derive(Debug, Clone, Copy)]
pub struct SupConLoss {
    /// Softmax temperature.
    pub temperature: f64,
    /// Reference temperature the loss is rescaled by.
    pub base_temperature: f64,
}

impl Default for SupConLoss {
    fn default() -> Self {
        Self {
            temperature: SUPCON_TEMPERATURE,
            base_temperature: SUPCON_TEMPERATURE,
        }
    }
}

impl LossObjective for SupConLoss {
    fn name(&self) -> &'static str {
        "SupConLoss"
    }

    fn compute(&self, body: &dyn EmbeddingBody, batch: &Batch) -> Result<Tensor> {
        let (embeddings, labels) = encode_labeled(body, batch, self.name())?;
        let n = labels.len();
        if n < 2 {
            return zero_loss(&embeddings);
        }
        let device = embeddings.device();
        let dtype = embeddings.dtype();

        let features = l2_normalize(&embeddings)?;
        let logits = features
            .matmul(&features.t()?)?
            .affine(1.0 / self.temperature, 0.0)?;
        let row_max = logits.max_keepdim(1)?.detach();
        let logits = logits.broadcast_sub(&row_max)?;

        let mut not_self = vec![1f32; n * n];
        let mut positive = vec![0f32; n * n];
        let mut positive_counts = vec![0f32; n];
        for a in 0..n {
            not_self[a * n + a] = 0.0;
            for p in (0..n).filter(|&p| p != a && labels[p] == labels[a]) {
                positive[a * n + p] = 1.0;
                positive_counts[a] += 1.0;
            }
        }
        let not_self = Tensor::from_vec(not_self, (n, n), device)?.to_dtype(dtype)?;
        let positive = Tensor::from_vec(positive, (n, n), device)?.to_dtype(dtype)?;
        let counts: Vec<f32> = positive_counts.into_iter().map(|c| c.max(1.0)).collect();
        let counts = Tensor::from_vec(counts, n, device)?.to_dtype(dtype)?;

        let exp_logits = (logits.exp()? * &not_self)?;
        let log_prob = logits.broadcast_sub(&exp_logits.sum_keepdim(1)?.log()?)?;
        let mean_log_prob_pos = (positive * log_prob)?.sum(1)?.div(&counts)?;

        Ok(mean_log_prob_pos
            .affine(-(self.temperature / self.base_temperature), 0.0)?
            .mean_all()?)
    }
}

/// Inputs to [`select_strategy`].
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    /// Loss kind.
    pub kind: LossKind,
    /// Distance for triplet losses.
    pub distance_metric: DistanceMetric,
    /// Triplet margin.
    pub margin: f64,
    /// Group size of the label-grouped sampler.
    pub samples_per_label: usize,
    /// Pair-generation passes.
    pub num_iterations: usize,
    /// Requested batch size.
    pub batch_size: usize,
    /// Use multi-label pair generation.
    pub multi_label: bool,
    /// Show the pair-generation progress bar.
    pub show_progress_bar: bool,
}

impl StrategyConfig {
    /// Take the loss settings from `args`.
    #[must_use]
    pub fn from_args(args: &TrainingArguments, kind: LossKind, batch_size: usize) -> Self {
        Self {
            kind,
            distance_metric: args.distance_metric,
            margin: args.margin,
            samples_per_label: args.samples_per_label,
            num_iterations: args.num_iterations,
            batch_size,
            multi_label: false,
            show_progress_bar: false,
        }
    }
}

/// Loaders and objective chosen for one body fit.
pub struct LossStrategy {
    /// Training batches.
    pub train_loader: DataLoader,
    /// Evaluation batches, when an eval split was given.
    pub test_loader: Option<DataLoader>,
    /// Objective shared by training and validation.
    pub loss: Arc<dyn LossObjective>,
}

impl LossStrategy {
    /// Effective batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.train_loader.batch_size()
    }
}

fn loader_rng(rng: &mut SeededRng) -> SeededRng {
    SeededRng::seed_from_u64(rng.next_u64())
}

/// Pick the data path and objective for `config.kind`.
///
/// Label-grouping losses wrap all examples in a [`LabelGroupedSampler`] with
/// `min(batch_size, len(sampler))` drop-last batches. The pairwise loss runs
/// `num_iterations` pair-generation passes over both splits.
///
/// # Errors
///
/// Returns [`SetFitError::Dataset`] when no label has `samples_per_label`
/// training examples, or a template error from the progress bar.
pub fn select_strategy(
    config: &StrategyConfig,
    train: (&[String], &[Label]),
    eval: Option<(&[String], &[Label])>,
    rng: &mut SeededRng,
) -> Result<LossStrategy> {
    let loss = build_loss(config.kind, config.distance_metric, config.margin);

    if config.kind.uses_label_grouping() {
        let sampler = LabelGroupedSampler::new(
            LabeledText::zip(train.0, train.1),
            config.samples_per_label,
            rng,
        );
        if sampler.is_empty() {
            return Err(SetFitError::Dataset(format!(
                "no label has at least samples_per_label={} training examples",
                config.samples_per_label
            )));
        }
        let batch_size = config.batch_size.min(sampler.len());
        let train_loader = DataLoader::label_grouped(sampler, batch_size, loader_rng(rng));

        let test_loader = eval.map(|(texts, labels)| {
            let sampler = LabelGroupedSampler::new(
                LabeledText::zip(texts, labels),
                config.samples_per_label,
                rng,
            );
            DataLoader::label_grouped(sampler, batch_size, loader_rng(rng))
        });

        tracing::debug!(
            "{} over {} label-grouped examples",
            loss.name(),
            train_loader.num_examples()
        );
        return Ok(LossStrategy {
            train_loader,
            test_loader,
            loss,
        });
    }

    let generator = PairGenerator::new(config.multi_label).with_progress_bar(config.show_progress_bar);
    let pb = generator.progress_bar(config.num_iterations)?;
    let mut train_pairs = Vec::new();
    let mut test_pairs = Vec::new();
    for _ in 0..config.num_iterations {
        train_pairs.extend(generator.pass(train.0, train.1, rng));
        if let Some((texts, labels)) = eval {
            test_pairs.extend(generator.pass(texts, labels, rng));
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let train_loader = DataLoader::pairs(train_pairs, config.batch_size, loader_rng(rng));
    let test_loader = eval.map(|_| DataLoader::pairs(test_pairs, config.batch_size, loader_rng(rng)));

    tracing::debug!(
        "{} over {} generated pairs",
        loss.name(),
        train_loader.num_examples()
    );
    Ok(LossStrategy {
        train_loader,
        test_loader,
        loss,
    })
}
