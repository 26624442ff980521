//! Label-grouped sampling and batch loaders.

use rand::prelude::*;

use crate::model::{Label, SeededRng};
use crate::pairs::ContrastivePair;

/// One labeled example.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledText {
    /// Input text.
    pub text: String,
    /// Target.
    pub label: Label,
}

impl LabeledText {
    /// Zip parallel arrays into examples.
    #[must_use]
    pub fn zip(texts: &[String], labels: &[Label]) -> Vec<Self> {
        texts
            .iter()
            .zip(labels)
            .map(|(text, label)| Self {
                text: text.clone(),
                label: label.clone(),
            })
            .collect()
    }
}

/// Sampler yielding `samples_per_label` consecutive examples of one label at
/// a time.
///
/// Labels with fewer than `samples_per_label` examples are left out. Within
/// a cycle through the (shuffled) label order an example is drawn at most
/// once; the seen-set resets and the order is reshuffled when the cycle ends.
#[derive(Debug, Clone)]
pub struct LabelGroupedSampler {
    examples: Vec<LabeledText>,
    right_borders: Vec<usize>,
    label_order: Vec<usize>,
    samples_per_label: usize,
}

impl LabelGroupedSampler {
    /// Group `examples` by label, in order of first appearance.
    ///
    /// # Panics
    ///
    /// Panics if `samples_per_label` is zero.
    #[must_use]
    pub fn new(examples: Vec<LabeledText>, samples_per_label: usize, rng: &mut SeededRng) -> Self {
        assert!(samples_per_label > 0, "samples_per_label must be > 0");

        let mut groups: Vec<(Label, Vec<LabeledText>)> = Vec::new();
        for example in examples {
            match groups.iter_mut().find(|(label, _)| *label == example.label) {
                Some((_, members)) => members.push(example),
                None => groups.push((example.label.clone(), vec![example])),
            }
        }

        let mut grouped = Vec::new();
        let mut right_borders = Vec::new();
        for (label, members) in groups {
            if members.len() < samples_per_label {
                tracing::debug!(
                    "Skipping label {label}: {} examples < samples_per_label {samples_per_label}",
                    members.len()
                );
                continue;
            }
            grouped.extend(members);
            right_borders.push(grouped.len());
        }

        let mut label_order: Vec<usize> = (0..right_borders.len()).collect();
        label_order.shuffle(rng);

        Self {
            examples: grouped,
            right_borders,
            label_order,
            samples_per_label,
        }
    }

    /// Examples kept after dropping under-represented labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Check if no label had enough examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Labels kept.
    #[must_use]
    pub fn num_labels(&self) -> usize {
        self.right_borders.len()
    }

    /// Indices for one epoch: exactly [`Self::len`] of them.
    pub fn epoch_indices(&mut self, rng: &mut SeededRng) -> Vec<usize> {
        let total = self.examples.len();
        let mut order = Vec::with_capacity(total);
        let mut seen = vec![false; total];
        let mut position = 0;

        while order.len() < total {
            let group = self.label_order[position];
            let left = if group == 0 { 0 } else { self.right_borders[group - 1] };
            let unseen: Vec<usize> = (left..self.right_borders[group])
                .filter(|&idx| !seen[idx])
                .collect();

            if unseen.len() >= self.samples_per_label {
                for &idx in unseen.choose_multiple(rng, self.samples_per_label) {
                    if order.len() == total {
                        break;
                    }
                    seen[idx] = true;
                    order.push(idx);
                }
            }

            position += 1;
            if position >= self.label_order.len() {
                position = 0;
                seen.fill(false);
                self.label_order.shuffle(rng);
            }
        }
        order
    }

    /// Examples for one epoch.
    pub fn epoch(&mut self, rng: &mut SeededRng) -> Vec<LabeledText> {
        self.epoch_indices(rng)
            .into_iter()
            .map(|idx| self.examples[idx].clone())
            .collect()
    }
}

/// One batch handed to a loss.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    /// Generated pairs.
    Pairs(Vec<ContrastivePair>),
    /// Label-grouped examples.
    Labeled(Vec<LabeledText>),
}

impl Batch {
    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Batch::Pairs(pairs) => pairs.len(),
            Batch::Labeled(examples) => examples.len(),
        }
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
enum LoaderSource {
    Pairs(Vec<ContrastivePair>),
    LabelGrouped(LabelGroupedSampler),
}

/// Batches a training set once per epoch.
///
/// Pair loaders shuffle every epoch and keep a trailing partial batch;
/// label-grouped loaders keep the sampler order and drop it.
#[derive(Debug, Clone)]
pub struct DataLoader {
    source: LoaderSource,
    batch_size: usize,
    rng: SeededRng,
}

impl DataLoader {
    /// Shuffling loader over generated pairs.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is zero.
    #[must_use]
    pub fn pairs(pairs: Vec<ContrastivePair>, batch_size: usize, rng: SeededRng) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        Self {
            source: LoaderSource::Pairs(pairs),
            batch_size,
            rng,
        }
    }

    /// Drop-last loader over a label-grouped sampler.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is zero.
    #[must_use]
    pub fn label_grouped(sampler: LabelGroupedSampler, batch_size: usize, rng: SeededRng) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        Self {
            source: LoaderSource::LabelGrouped(sampler),
            batch_size,
            rng,
        }
    }

    /// Batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Items per epoch before batching.
    #[must_use]
    pub fn num_examples(&self) -> usize {
        match &self.source {
            LoaderSource::Pairs(pairs) => pairs.len(),
            LoaderSource::LabelGrouped(sampler) => sampler.len(),
        }
    }

    /// Whether a trailing partial batch is discarded.
    #[must_use]
    pub fn drops_last(&self) -> bool {
        matches!(self.source, LoaderSource::LabelGrouped(_))
    }

    /// Batches per epoch.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        let n = self.num_examples();
        if self.drops_last() {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Draw the batches of the next epoch.
    pub fn epoch_batches(&mut self) -> Vec<Batch> {
        let batch_size = self.batch_size;
        match &mut self.source {
            LoaderSource::Pairs(pairs) => {
                let mut order: Vec<usize> = (0..pairs.len()).collect();
                order.shuffle(&mut self.rng);
                order
                    .chunks(batch_size)
                    .map(|chunk| Batch::Pairs(chunk.iter().map(|&i| pairs[i].clone()).collect()))
                    .collect()
            }
            LoaderSource::LabelGrouped(sampler) => {
                let examples = sampler.epoch(&mut self.rng);
                examples
                    .chunks_exact(batch_size)
                    .map(|chunk| Batch::Labeled(chunk.to_vec()))
                    .collect()
            }
        }
    }
}
