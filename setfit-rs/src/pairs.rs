//! Contrastive pair generation.
//!
//! Each pass walks every example once and emits, for that anchor, positive
//! pairs (target `1.0`) with examples sharing its label and one negative pair
//! (target `0.0`) with an example that does not. Passes are independent, so
//! running `n` of them yields `n` times the pairs of one pass.

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressStyle};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Label, SeededRng};

/// Two texts and their similarity target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastivePair {
    /// Anchor text.
    pub anchor: String,
    /// Partner text.
    pub other: String,
    /// `1.0` when both share a label, `0.0` otherwise.
    pub target: f32,
}

impl ContrastivePair {
    fn new(anchor: &str, other: &str, target: f32) -> Self {
        Self {
            anchor: anchor.to_string(),
            other: other.to_string(),
            target,
        }
    }

    /// Whether this is a positive pair.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.target > 0.5
    }
}

/// Pair generator for single- or multi-label data.
///
/// # Example
///
/// ```rust
/// use rand::SeedableRng;
/// use setfit_rs::model::{Label, SeededRng};
/// use setfit_rs::pairs::PairGenerator;
///
/// # fn main() -> setfit_rs::Result<()> {
/// let texts = vec!["good".to_string(), "great".to_string(), "bad".to_string()];
/// let labels = vec![Label::Single(1), Label::Single(1), Label::Single(0)];
///
/// let mut rng = SeededRng::seed_from_u64(42);
/// let pairs = PairGenerator::new(false).generate(&texts, &labels, 4, &mut rng)?;
///
/// // One positive and one negative per example and pass
/// assert_eq!(pairs.len(), 4 * 3 * 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct PairGenerator {
    multi_label: bool,
    show_progress_bar: bool,
}

impl PairGenerator {
    /// Create a generator; `multi_label` selects the multi-hot pass.
    #[must_use]
    pub fn new(multi_label: bool) -> Self {
        Self {
            multi_label,
            show_progress_bar: false,
        }
    }

    /// Show a "Generating Training Pairs" bar while generating.
    #[must_use]
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress_bar = show;
        self
    }

    /// Whether the multi-hot pass is used.
    #[must_use]
    pub fn is_multi_label(&self) -> bool {
        self.multi_label
    }

    /// Progress bar over `num_iterations` passes, hidden unless enabled.
    ///
    /// # Errors
    ///
    /// Returns a template error if the bar style is invalid.
    pub fn progress_bar(&self, num_iterations: usize) -> Result<ProgressBar> {
        if !self.show_progress_bar {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(num_iterations as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len}")?
                .progress_chars("#>-"),
        );
        pb.set_message("Generating Training Pairs");
        Ok(pb)
    }

    /// One pass over the examples.
    #[must_use]
    pub fn pass(&self, texts: &[String], labels: &[Label], rng: &mut SeededRng) -> Vec<ContrastivePair> {
        self.partners(labels).pass(texts, labels, rng)
    }

    fn partners<'l>(&self, labels: &'l [Label]) -> PartnerIndex<'l> {
        if self.multi_label {
            PartnerIndex::multi_label(labels)
        } else {
            PartnerIndex::single_label(labels)
        }
    }

    /// Run `num_iterations` passes and concatenate their pairs.
    ///
    /// # Errors
    ///
    /// Returns a template error if the progress bar cannot be styled.
    pub fn generate(
        &self,
        texts: &[String],
        labels: &[Label],
        num_iterations: usize,
        rng: &mut SeededRng,
    ) -> Result<Vec<ContrastivePair>> {
        let pb = self.progress_bar(num_iterations)?;
        let partners = self.partners(labels);
        let mut pairs = Vec::new();
        for _ in 0..num_iterations {
            pairs.extend(partners.pass(texts, labels, rng));
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(pairs)
    }
}

/// Partner candidates for every anchor. Labels are fixed across passes, so
/// this is built once per `generate` call.
enum PartnerIndex<'l> {
    Single {
        same: BTreeMap<&'l Label, Vec<usize>>,
        different: BTreeMap<&'l Label, Vec<usize>>,
    },
    Multi {
        carriers: BTreeMap<i64, Vec<usize>>,
        disjoint: BTreeMap<&'l Label, Vec<usize>>,
    },
}

impl<'l> PartnerIndex<'l> {
    fn single_label(labels: &'l [Label]) -> Self {
        let mut same: BTreeMap<&Label, Vec<usize>> = BTreeMap::new();
        for (idx, label) in labels.iter().enumerate() {
            same.entry(label).or_default().push(idx);
        }
        let different = same
            .keys()
            .map(|label| {
                let idx = (0..labels.len()).filter(|&j| labels[j] != **label).collect();
                (*label, idx)
            })
            .collect();
        PartnerIndex::Single { same, different }
    }

    fn multi_label(labels: &'l [Label]) -> Self {
        let mut carriers: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        let mut disjoint: BTreeMap<&Label, Vec<usize>> = BTreeMap::new();
        for (idx, label) in labels.iter().enumerate() {
            for class in label.active_classes() {
                carriers.entry(class).or_default().push(idx);
            }
            if !disjoint.contains_key(label) {
                let idx = (0..labels.len())
                    .filter(|&j| !labels[j].intersects(label))
                    .collect();
                disjoint.insert(label, idx);
            }
        }
        PartnerIndex::Multi { carriers, disjoint }
    }

    fn pass(&self, texts: &[String], labels: &[Label], rng: &mut SeededRng) -> Vec<ContrastivePair> {
        let mut pairs = Vec::with_capacity(texts.len() * 2);
        match self {
            PartnerIndex::Single { same, different } => {
                for (anchor, label) in texts.iter().zip(labels) {
                    if let Some(&pos) = same.get(label).and_then(|idx| idx.choose(rng)) {
                        pairs.push(ContrastivePair::new(anchor, &texts[pos], 1.0));
                    }
                    if let Some(&neg) = different.get(label).and_then(|idx| idx.choose(rng)) {
                        pairs.push(ContrastivePair::new(anchor, &texts[neg], 0.0));
                    }
                }
            }
            PartnerIndex::Multi { carriers, disjoint } => {
                for (anchor, label) in texts.iter().zip(labels) {
                    // No disjoint partner means no negative; skip the anchor.
                    let Some(negatives) = disjoint.get(label).filter(|idx| !idx.is_empty()) else {
                        continue;
                    };
                    for class in label.active_classes() {
                        if let Some(&pos) = carriers.get(&class).and_then(|idx| idx.choose(rng)) {
                            pairs.push(ContrastivePair::new(anchor, &texts[pos], 1.0));
                        }
                    }
                    if let Some(&neg) = negatives.choose(rng) {
                        pairs.push(ContrastivePair::new(anchor, &texts[neg], 0.0));
                    }
                }
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text {i}")).collect()
    }

    fn singles(ids: &[i64]) -> Vec<Label> {
        ids.iter().copied().map(Label::Single).collect()
    }

    #[test]
    fn test_single_label_pass_targets() {
        let texts = texts(6);
        let labels = singles(&[0, 0, 0, 1, 1, 1]);
        let mut rng = SeededRng::seed_from_u64(42);

        let pairs = PairGenerator::new(false).pass(&texts, &labels, &mut rng);
        assert_eq!(pairs.len(), 12);

        let label_of = |t: &str| labels[texts.iter().position(|x| x == t).unwrap()].clone();
        for pair in &pairs {
            let same = label_of(&pair.anchor) == label_of(&pair.other);
            assert_eq!(same, pair.is_positive(), "{pair:?}");
        }
        assert_eq!(pairs.iter().filter(|p| p.is_positive()).count(), 6);
    }

    #[test]
    fn test_pair_count_linear_in_iterations() {
        let texts = texts(8);
        let labels = singles(&[0, 1, 2, 0, 1, 2, 0, 1]);
        let generator = PairGenerator::new(false);

        let mut previous = 0;
        for n in 0..5 {
            let mut rng = SeededRng::seed_from_u64(7);
            let count = generator.generate(&texts, &labels, n, &mut rng).unwrap().len();
            assert_eq!(count, n * 16);
            assert!(count >= previous);
            previous = count;
        }
    }

    #[test]
    fn test_single_class_skips_negatives() {
        let texts = texts(3);
        let labels = singles(&[5, 5, 5]);
        let mut rng = SeededRng::seed_from_u64(0);

        let pairs = PairGenerator::new(false).pass(&texts, &labels, &mut rng);
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(ContrastivePair::is_positive));
    }

    #[test]
    fn test_generation_is_reproducible() {
        let texts = texts(10);
        let labels = singles(&[0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
        let generator = PairGenerator::new(false);

        let mut a = SeededRng::seed_from_u64(42);
        let mut b = SeededRng::seed_from_u64(42);
        assert_eq!(
            generator.generate(&texts, &labels, 3, &mut a).unwrap(),
            generator.generate(&texts, &labels, 3, &mut b).unwrap()
        );
    }

    #[test]
    fn test_multilabel_skips_anchor_without_disjoint_partner() {
        let texts = texts(3);
        let labels = vec![
            Label::Multi(vec![1, 1, 0]),
            Label::Multi(vec![1, 0, 0]),
            Label::Multi(vec![0, 1, 0]),
        ];
        let mut rng = SeededRng::seed_from_u64(1);

        let pairs = PairGenerator::new(true).pass(&texts, &labels, &mut rng);
        // Anchor 0 overlaps both others; anchors 1 and 2 are disjoint.
        assert!(pairs.iter().all(|p| p.anchor != "text 0"));
        assert_eq!(pairs.len(), 4);
    }

    #[test]
    fn test_multilabel_positive_per_active_class() {
        let texts = texts(4);
        let labels = vec![
            Label::Multi(vec![1, 1, 0]),
            Label::Multi(vec![1, 0, 0]),
            Label::Multi(vec![0, 1, 0]),
            Label::Multi(vec![0, 0, 1]),
        ];
        let mut rng = SeededRng::seed_from_u64(3);

        let pairs = PairGenerator::new(true).pass(&texts, &labels, &mut rng);
        let from_first: Vec<_> = pairs.iter().filter(|p| p.anchor == "text 0").collect();
        assert_eq!(from_first.iter().filter(|p| p.is_positive()).count(), 2);
        assert_eq!(from_first.iter().filter(|p| !p.is_positive()).count(), 1);
        let negative = from_first.iter().find(|p| !p.is_positive()).unwrap();
        assert_eq!(negative.other, "text 3");
    }

    #[test]
    fn test_generate_matches_repeated_passes() {
        let texts = texts(6);
        let labels = vec![
            Label::Multi(vec![1, 0, 0]),
            Label::Multi(vec![1, 0, 0]),
            Label::Multi(vec![0, 1, 0]),
            Label::Multi(vec![0, 1, 1]),
            Label::Multi(vec![0, 0, 1]),
            Label::Multi(vec![1, 1, 1]),
        ];
        let generator = PairGenerator::new(true);

        let mut a = SeededRng::seed_from_u64(9);
        let generated = generator.generate(&texts, &labels, 4, &mut a).unwrap();

        let mut b = SeededRng::seed_from_u64(9);
        let passes: Vec<ContrastivePair> = (0..4)
            .flat_map(|_| generator.pass(&texts, &labels, &mut b))
            .collect();

        assert_eq!(generated, passes);
        // The all-ones anchor has no disjoint partner in any pass.
        assert!(generated.iter().all(|p| p.anchor != "text 5"));
    }

    #[test]
    fn test_hidden_progress_bar() {
        let pb = PairGenerator::new(false).progress_bar(10).unwrap();
        assert!(pb.is_hidden());
    }
}
