/// Training infrastructure: schedule, optimizer, metrics, validation, checkpoints
pub mod checkpoint;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;
pub mod validation;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use metrics::{EpochMetrics, RunningMetric};
pub use optimizer::{clip_grad_norm, Adam, AdamConfig, ParamGroup};
pub use scheduler::{ScheduleConfig, ScheduleMethod, SchedulePhase, StepDecayScheduler};
pub use trainer::{EpochSummary, Trainer, TrainingConfig, TrainingState};
pub use validation::{AccuracyValidator, Validator};
