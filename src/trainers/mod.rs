//! Training loop, per-step prediction, and the noise scheduler.

pub mod ddpm_scheduler;
pub mod fine_tune;
pub mod image_utils;
pub mod predictor;

pub use ddpm_scheduler::{BetaSchedule, DdpmScheduler};
pub use fine_tune::{FineTuneTrainer, TrainCommands, TrainOutcome};
pub use predictor::{predict, DebugSink, FileDebugSink, StepPrediction};
