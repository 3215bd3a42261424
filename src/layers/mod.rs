/// Neural network layer primitives used by the baseline model
pub mod embeddings;

pub use embeddings::{length_mask, QuestionEmbedding};
