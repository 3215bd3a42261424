//! GQA trainer - epoch-level training orchestration on candle
//!
//! Trains a question-answering-over-images predictor with a fixed recipe:
//! cross-entropy over a closed answer vocabulary, Adam updates with global
//! gradient-norm clipping, and validation accuracy for model selection.
//!
//! # Architecture
//!
//! - **Trainer**: owns the epoch loop and the training state
//! - **StepDecayScheduler**: per-epoch warmup table, then step decay
//! - **CheckpointManager**: safetensors snapshots, saved only on improvement
//! - **Validator**: accuracy on a held-out split in inference mode
//!
//! # Example
//!
//! ```ignore
//! use gqa_trainer::{ExperimentConfig, ComputeContext};
//! use gqa_trainer::training::{AccuracyValidator, Trainer, TrainingConfig};
//!
//! let config = ExperimentConfig::from_file("configs/gqa.json")?;
//! let ctx = ComputeContext::from_config(&config)?;
//! let training = TrainingConfig::from_experiment(&config);
//! let mut trainer = Trainer::new(model, varmap, model_args, training, ctx)?;
//! let best = trainer.run(&mut train_loader, Some(&mut validator))?;
//! ```

pub mod config;
pub mod data;
pub mod device;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{ExperimentConfig, ExperimentLayout};
pub use device::ComputeContext;
pub use models::{ModelArgs, QaModel};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Batch shape error: {0}")]
    DataShape(String),

    #[error("Checkpoint error: {0}")]
    CheckpointIo(String),

    #[error("Non-finite loss at epoch {epoch}, batch {batch}: {loss}")]
    NumericInstability { epoch: usize, batch: usize, loss: f64 },

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NumPy read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),
}

pub type Result<T> = std::result::Result<T, TrainError>;
