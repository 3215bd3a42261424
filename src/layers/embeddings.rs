/// Question embedding with length-masked mean pooling
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Embedding, VarBuilder};

pub struct QuestionEmbedding {
    embedding: Embedding,
    target_dtype: DType,
}

impl QuestionEmbedding {
    pub fn new(vocab_size: usize, hidden_size: usize, vb: VarBuilder, target_dtype: DType) -> Result<Self> {
        let embedding = candle_nn::embedding(vocab_size, hidden_size, vb)?;
        Ok(Self {
            embedding,
            target_dtype,
        })
    }

    /// Token embeddings [batch, seq_len, hidden]
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let output = self.embedding.forward(tokens)?;
        if output.dtype() != self.target_dtype {
            output.to_dtype(self.target_dtype)
        } else {
            Ok(output)
        }
    }

    /// Mean of the first `lens[i]` token embeddings of each row [batch, hidden]
    pub fn pooled(&self, tokens: &Tensor, lens: &Tensor) -> Result<Tensor> {
        let embedded = self.forward(tokens)?;
        let seq_len = tokens.dim(1)?;

        let mask = length_mask(lens, seq_len)?.to_dtype(self.target_dtype)?;
        let summed = embedded.broadcast_mul(&mask.unsqueeze(D::Minus1)?)?.sum(1)?;

        // Empty questions pool to zero instead of dividing by zero
        let counts = mask.sum_keepdim(1)?.maximum(1.0)?;
        summed.broadcast_div(&counts)
    }
}

/// 1 where position < length, 0 elsewhere [batch, seq_len]
pub fn length_mask(lens: &Tensor, seq_len: usize) -> Result<Tensor> {
    let positions = Tensor::arange(0u32, seq_len as u32, lens.device())?.unsqueeze(0)?;
    let lens = lens.to_dtype(DType::U32)?.unsqueeze(1)?;
    positions.broadcast_lt(&lens)
}
