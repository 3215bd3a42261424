/// Predictor interface and the baseline GQA network
use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

pub use crate::data::ModelInputs;

pub mod baseline;
pub mod loader;

pub use baseline::BaselineQaNet;

/// Arguments a model is constructed from, persisted with every checkpoint
///
/// The vocabulary is passed separately and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Object feature dimension
    pub img_size: usize,
    /// Object box feature dimension
    pub spatial_dim: usize,
    /// Number of reasoning steps
    pub max_step: usize,
    pub hidden_size: usize,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            img_size: 2048,
            spatial_dim: 7,
            max_step: 4,
            hidden_size: 512,
        }
    }
}

/// Output of a forward pass
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Unnormalised answer scores [batch, num_answers]
    pub logits: Tensor,
    /// Model-specific extra output (attention maps and the like)
    pub auxiliary: Option<Tensor>,
}

/// A predictor mapping a batch of questions and image features to answer logits
///
/// Trainable parameters live in the `VarMap` the model was built from.
pub trait QaModel {
    /// Forward pass; `train` enables training-only behaviour such as dropout
    fn forward(&self, inputs: &ModelInputs, train: bool) -> Result<ModelOutput>;
}
