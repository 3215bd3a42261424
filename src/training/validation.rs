/// Validation: accuracy of the current model on a held-out split
use candle_core::{DType, Result, Tensor, D};

use crate::data::BatchSource;
use crate::device::ComputeContext;
use crate::models::QaModel;

/// Produces a score in [0, 1] for the current model snapshot
///
/// Implementations run inference only: they must not compute gradients or
/// touch the optimizer.
pub trait Validator {
    fn validate(&mut self, model: &dyn QaModel, ctx: &ComputeContext) -> crate::Result<f64>;
}

/// Number of rows where argmax(logits) equals the label
pub fn count_correct(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let predictions = logits.argmax(D::Minus1)?;
    let correct = predictions
        .eq(&labels.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct as usize)
}

/// Fraction of rows where argmax(logits) equals the label
pub fn batch_accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let n = labels.dim(0)?;
    if n == 0 {
        return Ok(0.0);
    }
    Ok(count_correct(logits, labels)? as f64 / n as f64)
}

/// Classification accuracy over every batch of a validation source
pub struct AccuracyValidator<S: BatchSource> {
    source: S,
}

impl<S: BatchSource> AccuracyValidator<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: BatchSource> Validator for AccuracyValidator<S> {
    fn validate(&mut self, model: &dyn QaModel, ctx: &ComputeContext) -> crate::Result<f64> {
        let mut correct = 0usize;
        let mut total = 0usize;

        self.source.reset();
        while let Some(mut batch) = self.source.next_batch()? {
            batch.validate()?;
            batch.sort_by_length();

            let inputs = batch.place(ctx)?;
            let answers = ctx.place_u32(&batch.answers)?;

            // Inference only: no backward pass, so nothing is recorded for gradients
            let output = model.forward(&inputs, false)?;
            correct += count_correct(&output.logits.detach(), &answers)?;
            total += batch.len();
        }

        let accuracy = if total == 0 {
            log::warn!("validation source produced no examples");
            0.0
        } else {
            correct as f64 / total as f64
        };

        log::info!("~~~~~~ Valid Accuracy: {:.4} ~~~~~~~", accuracy);
        Ok(accuracy)
    }
}
