//! Learning rate schedules for the body fit.

/// Linear warmup from zero to the base rate, then linear decay to zero.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

/// Warmup length for a run: `ceil(total_steps * warmup_proportion)`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn warmup_steps(total_steps: usize, warmup_proportion: f64) -> usize {
    (total_steps as f64 * warmup_proportion).ceil().max(0.0) as usize
}

impl LrScheduler {
    /// Create a scheduler over `total_steps` steps, the first
    /// `warmup_steps` of which ramp up.
    #[must_use]
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Learning rate for the current step.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            return self.base_lr * (self.current_step as f64 / self.warmup_steps as f64);
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base_lr;
        }
        let progress =
            ((self.current_step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        self.base_lr * (1.0 - progress).max(0.0)
    }

    /// Learning rate used by the next optimizer step; advances the schedule.
    pub fn step(&mut self) -> f64 {
        let lr = self.get_lr();
        self.current_step += 1;
        lr
    }

    /// Steps taken so far.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}
