//! Monotonic training counters shared between the trainer and the data loader.

use serde::{Deserialize, Serialize};

/// Position of a training run. The trainer owns the counters and advances them
/// only after a step's side effects are durable, so resuming from a persisted
/// copy never skips or double-applies a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainProgress {
    pub epoch: usize,
    pub epoch_sample: usize,
    pub global_step: usize,
}

impl TrainProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance past one consumed batch.
    pub fn next_step(&mut self, batch_size: usize) {
        self.epoch_sample += batch_size;
        self.global_step += 1;
    }

    pub fn next_epoch(&mut self) {
        self.epoch += 1;
        self.epoch_sample = 0;
    }
}
