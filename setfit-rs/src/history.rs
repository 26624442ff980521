//! Training history and the listener interface fit loops report through.

use serde::{Deserialize, Serialize};

/// One reported training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainStep {
    /// Index of the objective within the fit call.
    pub objective_index: usize,
    /// Epoch, 0-based.
    pub epoch: usize,
    /// Step within the epoch, 1-based.
    pub step: usize,
    /// Learning rate used by this step.
    pub learning_rate: f64,
    /// Loss of this step.
    pub loss: f64,
}

/// One reported evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalStep {
    /// Epoch, 0-based.
    pub epoch: usize,
    /// Steps taken in that epoch.
    pub step: usize,
    /// Evaluation loss (or score).
    pub loss: f64,
}

/// Observer of a fit loop. Calls arrive synchronously on the training thread.
pub trait TrainingListener {
    /// A training step was taken.
    fn on_train_step(&mut self, step: TrainStep);

    /// An evaluation finished.
    fn on_eval_step(&mut self, step: EvalStep);
}

/// Training-log entry. Head entries leave `phase_index`, `step` and
/// `learning_rate` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainLogEntry {
    /// Objective index within the fit call.
    pub phase_index: Option<usize>,
    /// Epoch.
    pub epoch: usize,
    /// Step within the epoch.
    pub step: Option<usize>,
    /// Learning rate.
    pub learning_rate: Option<f64>,
    /// Loss.
    pub loss_value: f64,
}

/// Evaluation-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLogEntry {
    /// Epoch.
    pub epoch: usize,
    /// Evaluation loss.
    pub loss_value: f64,
}

/// Append-only train and test logs of one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    train: Vec<TrainLogEntry>,
    test: Vec<TestLogEntry>,
}

impl History {
    /// Training entries in arrival order.
    #[must_use]
    pub fn train(&self) -> &[TrainLogEntry] {
        &self.train
    }

    /// Evaluation entries in arrival order.
    #[must_use]
    pub fn test(&self) -> &[TestLogEntry] {
        &self.test
    }

    /// Check if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.test.is_empty()
    }

    /// Append a training entry.
    pub fn record_train(&mut self, entry: TrainLogEntry) {
        self.train.push(entry);
    }

    /// Append an evaluation entry.
    pub fn record_test(&mut self, entry: TestLogEntry) {
        self.test.push(entry);
    }
}

/// Which history a listener writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Contrastive body fit.
    Body,
    /// Head fit.
    Head,
}

/// Histories of both phases, kept for the trainer's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecorder {
    body: History,
    head: History,
}

impl ProgressRecorder {
    /// Create empty histories.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Body (embedding) history.
    #[must_use]
    pub fn body(&self) -> &History {
        &self.body
    }

    /// Head (classifier) history.
    #[must_use]
    pub fn head(&self) -> &History {
        &self.head
    }

    /// Listener that records into the history of `phase`.
    pub fn listener(&mut self, phase: Phase) -> PhaseListener<'_> {
        let history = match phase {
            Phase::Body => &mut self.body,
            Phase::Head => &mut self.head,
        };
        PhaseListener { phase, history }
    }
}

/// [`TrainingListener`] bound to one phase's history.
#[derive(Debug)]
pub struct PhaseListener<'a> {
    phase: Phase,
    history: &'a mut History,
}

impl TrainingListener for PhaseListener<'_> {
    fn on_train_step(&mut self, step: TrainStep) {
        let entry = match self.phase {
            Phase::Body => TrainLogEntry {
                phase_index: Some(step.objective_index),
                epoch: step.epoch,
                step: Some(step.step),
                learning_rate: Some(step.learning_rate),
                loss_value: step.loss,
            },
            Phase::Head => TrainLogEntry {
                phase_index: None,
                epoch: step.epoch,
                step: None,
                learning_rate: None,
                loss_value: step.loss,
            },
        };
        tracing::debug!(
            "{:?} epoch {} step {:?}: loss {:.6}",
            self.phase,
            entry.epoch,
            entry.step,
            entry.loss_value
        );
        self.history.record_train(entry);
    }

    fn on_eval_step(&mut self, step: EvalStep) {
        tracing::info!(
            "{:?} epoch {}: eval loss {:.6}",
            self.phase,
            step.epoch,
            step.loss
        );
        self.history.record_test(TestLogEntry {
            epoch: step.epoch,
            loss_value: step.loss,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(epoch: usize, loss: f64) -> TrainStep {
        TrainStep {
            objective_index: 0,
            epoch,
            step: 3,
            learning_rate: 1e-5,
            loss,
        }
    }

    #[test]
    fn test_body_listener_keeps_step_details() {
        let mut recorder = ProgressRecorder::new();
        recorder.listener(Phase::Body).on_train_step(step(0, 0.5));

        let entry = &recorder.body().train()[0];
        assert_eq!(entry.phase_index, Some(0));
        assert_eq!(entry.step, Some(3));
        assert_eq!(entry.learning_rate, Some(1e-5));
        assert!(recorder.head().is_empty());
    }

    #[test]
    fn test_head_listener_drops_step_details() {
        let mut recorder = ProgressRecorder::new();
        {
            let mut listener = recorder.listener(Phase::Head);
            listener.on_train_step(step(1, 0.25));
            listener.on_eval_step(EvalStep {
                epoch: 1,
                step: 0,
                loss: 0.3,
            });
        }

        assert_eq!(
            recorder.head().train(),
            &[TrainLogEntry {
                phase_index: None,
                epoch: 1,
                step: None,
                learning_rate: None,
                loss_value: 0.25,
            }]
        );
        assert_eq!(recorder.head().test()[0].loss_value, 0.3);
        assert!(recorder.body().is_empty());
    }

    #[test]
    fn test_history_is_append_only() {
        let mut recorder = ProgressRecorder::new();
        recorder.listener(Phase::Body).on_train_step(step(0, 1.0));
        let snapshot = recorder.body().train().to_vec();

        recorder.listener(Phase::Body).on_train_step(step(1, 0.5));
        assert_eq!(&recorder.body().train()[..1], snapshot.as_slice());
        assert_eq!(recorder.body().train().len(), 2);
    }

    #[test]
    fn test_history_serializes() {
        let mut recorder = ProgressRecorder::new();
        recorder.listener(Phase::Head).on_train_step(step(0, 0.1));
        let json = serde_json::to_string(&recorder).unwrap();
        assert!(json.contains("\"phase_index\":null"));
        let restored: ProgressRecorder = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, recorder);
    }
}
