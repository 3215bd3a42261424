/// Baseline GQA network: pooled question, iterative attention over objects
use candle_core::{DType, Module, Result, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::{ModelArgs, ModelInputs, ModelOutput, QaModel};
use crate::data::Vocab;
use crate::layers::QuestionEmbedding;

/// Dropout applied to the final state during training
const DROPOUT: f32 = 0.15;

/// Question-guided attention over object features, refined for `max_step` steps
///
/// Each step attends over the projected objects with the current state as the
/// query and folds the attended read, gated by the question, back into the state.
pub struct BaselineQaNet {
    question_embed: QuestionEmbedding,
    visual_proj: Linear,
    spatial_proj: Linear,
    steps: Vec<Linear>,
    classifier: Linear,
}

impl BaselineQaNet {
    pub fn new(args: &ModelArgs, vocab: &Vocab, vb: VarBuilder) -> Result<Self> {
        if vocab.num_question_tokens() == 0 || vocab.num_answers() == 0 {
            return Err(candle_core::Error::Msg(
                "vocabulary must contain question tokens and answers".to_string(),
            ));
        }

        let hidden = args.hidden_size;
        let question_embed = QuestionEmbedding::new(
            vocab.num_question_tokens(),
            hidden,
            vb.pp("question_embed"),
            DType::F32,
        )?;
        let visual_proj = linear(args.img_size, hidden, vb.pp("visual_proj"))?;
        let spatial_proj = linear(args.spatial_dim, hidden, vb.pp("spatial_proj"))?;
        let steps = (0..args.max_step)
            .map(|i| linear(hidden, hidden, vb.pp(format!("steps.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        let classifier = linear(hidden, vocab.num_answers(), vb.pp("classifier"))?;

        Ok(Self {
            question_embed,
            visual_proj,
            spatial_proj,
            steps,
            classifier,
        })
    }
}

impl QaModel for BaselineQaNet {
    fn forward(&self, inputs: &ModelInputs, train: bool) -> Result<ModelOutput> {
        let question = self
            .question_embed
            .pooled(&inputs.questions, &inputs.question_lens)?;

        // [batch, objects, hidden]
        let objects = (self.visual_proj.forward(&inputs.object_features)?
            + self.spatial_proj.forward(&inputs.spatial_features)?)?
        .relu()?;

        let mut state = question.clone();
        let mut attention = None;
        for step in &self.steps {
            let scores = objects.matmul(&state.unsqueeze(2)?)?.squeeze(2)?;
            let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
            let read = objects.broadcast_mul(&weights.unsqueeze(2)?)?.sum(1)?;

            let update = step.forward(&(read * &question)?)?.tanh()?;
            state = (state + update)?;
            attention = Some(weights);
        }

        let state = if train {
            candle_nn::ops::dropout(&state, DROPOUT)?
        } else {
            state
        };

        Ok(ModelOutput {
            logits: self.classifier.forward(&state)?,
            auxiliary: attention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use candle_nn::VarMap;

    fn vocab() -> Vocab {
        Vocab {
            question_token_to_idx: (0..6).map(|i| (format!("q{}", i), i)).collect(),
            answer_token_to_idx: (0..3).map(|i| (format!("a{}", i), i)).collect(),
        }
    }

    fn inputs(device: &Device) -> Result<ModelInputs> {
        Ok(ModelInputs {
            questions: Tensor::new(&[[1u32, 2, 3], [4, 5, 0]], device)?,
            question_lens: Tensor::new(&[3u32, 2], device)?,
            object_features: Tensor::randn(0f32, 1.0, (2, 5, 8), device)?,
            spatial_features: Tensor::randn(0f32, 1.0, (2, 5, 4), device)?,
        })
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let args = ModelArgs {
            img_size: 8,
            spatial_dim: 4,
            max_step: 2,
            hidden_size: 16,
        };
        let model = BaselineQaNet::new(&args, &vocab(), vb)?;

        let output = model.forward(&inputs(&device)?, false)?;
        assert_eq!(output.logits.dims(), &[2, 3]);
        assert_eq!(output.auxiliary.map(|a| a.dims().to_vec()), Some(vec![2, 5]));

        Ok(())
    }

    #[test]
    fn test_inference_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let args = ModelArgs {
            img_size: 8,
            spatial_dim: 4,
            max_step: 1,
            hidden_size: 8,
        };
        let model = BaselineQaNet::new(&args, &vocab(), vb)?;

        let batch = inputs(&device)?;
        let a = model.forward(&batch, false)?.logits.to_vec2::<f32>()?;
        let b = model.forward(&batch, false)?.logits.to_vec2::<f32>()?;
        assert_eq!(a, b);

        Ok(())
    }

    #[test]
    fn test_empty_vocab_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(BaselineQaNet::new(&ModelArgs::default(), &Vocab::default(), vb).is_err());
    }
}
