//! Linear warmup followed by cosine decay.

use std::f32::consts::PI;

#[derive(Debug, Clone, Copy)]
pub struct LrSchedule {
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub max_steps: usize,
}

impl LrSchedule {
    pub fn new(max_lr: f32, min_lr: f32, warmup_steps: usize, max_steps: usize) -> Self {
        Self {
            max_lr,
            min_lr,
            warmup_steps,
            max_steps,
        }
    }

    /// Learning rate for optimizer step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.max_lr * (step + 1) as f32 / self.warmup_steps as f32;
        }
        if step > self.max_steps {
            return self.min_lr;
        }
        let ratio =
            (step - self.warmup_steps) as f32 / (self.max_steps - self.warmup_steps) as f32;
        // Goes from 1 at the end of warmup to 0 at max_steps.
        let coeff = 0.5 * (1.0 + (PI * ratio).cos());
        self.min_lr + coeff * (self.max_lr - self.min_lr)
    }
}
