//! Learning-rate schedule: linear warmup followed by linear decay to zero

/// Linear warmup then linear decay over `total_steps` optimizer steps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self { base_lr, warmup_steps, total_steps }
    }

    /// Warmup length is `ceil(warmup_ratio * total_steps)`
    pub fn with_warmup_ratio(base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup_steps = (warmup_ratio * total_steps as f64).ceil() as usize;
        Self::new(base_lr, warmup_steps, total_steps)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Learning rate used for the optimizer step taken after `step` completed steps
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let decay_len = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / decay_len).max(0.0)
    }
}
