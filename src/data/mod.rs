/// Data loading for GQA training
pub mod npy_dataset;

pub use npy_dataset::{NpyQaDataset, NpyQaLoader, Vocab};

use candle_core::Tensor;
use ndarray::{Array1, Array2, Array3, Axis};

use crate::device::ComputeContext;

/// One batch of aligned training examples, host side
///
/// Every array shares the leading dimension N.
#[derive(Debug, Clone)]
pub struct Batch {
    pub question_ids: Vec<u64>,
    pub image_ids: Vec<String>,
    /// Answer labels [N]
    pub answers: Array1<u32>,
    /// Padded question tokens [N, max_len]
    pub questions: Array2<u32>,
    /// Object appearance features [N, num_objects, vision_dim]
    pub object_features: Array3<f32>,
    /// Object box features [N, num_objects, spatial_dim]
    pub spatial_features: Array3<f32>,
    /// Question lengths [N]
    pub question_lens: Array1<u32>,
}

/// Model inputs of a batch, on the compute device
#[derive(Debug, Clone)]
pub struct ModelInputs {
    pub questions: Tensor,
    pub question_lens: Tensor,
    pub object_features: Tensor,
    pub spatial_features: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Check that every array has the same leading dimension
    pub fn validate(&self) -> crate::Result<()> {
        let n = self.answers.len();
        let leading = [
            ("question_ids", self.question_ids.len()),
            ("image_ids", self.image_ids.len()),
            ("questions", self.questions.len_of(Axis(0))),
            ("object_features", self.object_features.len_of(Axis(0))),
            ("spatial_features", self.spatial_features.len_of(Axis(0))),
            ("question_lens", self.question_lens.len()),
        ];

        for (name, len) in leading {
            if len != n {
                return Err(crate::TrainError::DataShape(format!(
                    "{} has {} entries, answers has {}",
                    name, len, n
                )));
            }
        }

        let max_len = self.questions.len_of(Axis(1));
        if let Some(&bad) = self.question_lens.iter().find(|&&l| l as usize > max_len) {
            return Err(crate::TrainError::DataShape(format!(
                "question length {} exceeds padded width {}",
                bad, max_len
            )));
        }

        Ok(())
    }

    /// Order of entries by descending question length, ties in original order
    pub fn length_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.question_lens.len()).collect();
        order.sort_by(|&a, &b| self.question_lens[b].cmp(&self.question_lens[a]));
        order
    }

    /// Reorder every array by descending question length
    pub fn sort_by_length(&mut self) {
        let order = self.length_order();
        if order.iter().enumerate().all(|(i, &j)| i == j) {
            return;
        }

        self.question_ids = order.iter().map(|&i| self.question_ids[i]).collect();
        self.image_ids = order.iter().map(|&i| self.image_ids[i].clone()).collect();
        self.answers = self.answers.select(Axis(0), &order);
        self.questions = self.questions.select(Axis(0), &order);
        self.object_features = self.object_features.select(Axis(0), &order);
        self.spatial_features = self.spatial_features.select(Axis(0), &order);
        self.question_lens = self.question_lens.select(Axis(0), &order);
    }

    /// Copy model inputs to the device
    pub fn place(&self, ctx: &ComputeContext) -> candle_core::Result<ModelInputs> {
        Ok(ModelInputs {
            questions: ctx.place_u32(&self.questions)?,
            question_lens: ctx.place_u32(&self.question_lens)?,
            object_features: ctx.place_f32(&self.object_features)?,
            spatial_features: ctx.place_f32(&self.spatial_features)?,
        })
    }
}

/// Source of batches, restartable once per epoch
pub trait BatchSource {
    /// Next batch of the current pass, `None` when exhausted
    fn next_batch(&mut self) -> crate::Result<Option<Batch>>;

    /// Start a new pass
    fn reset(&mut self);

    /// Number of batches per pass
    fn num_batches(&self) -> usize;

    /// Number of examples per pass
    fn num_examples(&self) -> usize;
}

/// Batches held in memory, replayed in the same order every pass
#[derive(Debug, Clone, Default)]
pub struct InMemoryBatches {
    batches: Vec<Batch>,
    cursor: usize,
}

impl InMemoryBatches {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl BatchSource for InMemoryBatches {
    fn next_batch(&mut self) -> crate::Result<Option<Batch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn num_examples(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::Array;

    /// Batch whose entry i has answer i, question tokens all i+1 and object features i
    pub(crate) fn toy_batch(lens: &[u32], max_len: usize) -> Batch {
        let n = lens.len();
        Batch {
            question_ids: (0..n as u64).collect(),
            image_ids: (0..n).map(|i| format!("img{}", i)).collect(),
            answers: Array::from_iter(0..n as u32),
            questions: Array2::from_shape_fn((n, max_len), |(i, j)| {
                if (j as u32) < lens[i] { i as u32 + 1 } else { 0 }
            }),
            object_features: Array3::from_shape_fn((n, 2, 3), |(i, _, _)| i as f32),
            spatial_features: Array3::from_shape_fn((n, 2, 4), |(i, _, _)| i as f32),
            question_lens: Array::from_vec(lens.to_vec()),
        }
    }

    #[test]
    fn test_length_order() {
        let batch = toy_batch(&[2, 5, 1, 4], 5);
        assert_eq!(batch.length_order(), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_sort_reorders_all_arrays() -> crate::Result<()> {
        let mut batch = toy_batch(&[2, 5, 1, 4], 5);
        batch.sort_by_length();
        batch.validate()?;

        assert_eq!(batch.question_ids, vec![1, 3, 0, 2]);
        assert_eq!(batch.image_ids, vec!["img1", "img3", "img0", "img2"]);
        assert_eq!(batch.answers.to_vec(), vec![1, 3, 0, 2]);
        assert_eq!(batch.question_lens.to_vec(), vec![5, 4, 2, 1]);
        assert_eq!(batch.questions[[0, 0]], 2);
        assert_eq!(batch.questions[[3, 0]], 3);
        assert_eq!(batch.object_features[[1, 0, 0]], 3.0);
        assert_eq!(batch.spatial_features[[2, 1, 3]], 0.0);

        Ok(())
    }

    #[test]
    fn test_sort_is_stable_on_ties() {
        let mut batch = toy_batch(&[3, 1, 3, 3], 3);
        batch.sort_by_length();
        assert_eq!(batch.question_ids, vec![0, 2, 3, 1]);
    }

    #[test]
    fn test_validate_rejects_mismatched_lengths() {
        let mut batch = toy_batch(&[2, 5, 1, 4], 5);
        batch.image_ids.pop();
        assert!(matches!(batch.validate(), Err(crate::TrainError::DataShape(_))));

        let mut batch = toy_batch(&[2, 5], 5);
        batch.question_lens[0] = 9;
        assert!(matches!(batch.validate(), Err(crate::TrainError::DataShape(_))));
    }

    #[test]
    fn test_in_memory_source_restarts() -> crate::Result<()> {
        let mut source = InMemoryBatches::new(vec![toy_batch(&[1, 2], 2), toy_batch(&[2], 2)]);
        assert_eq!(source.num_batches(), 2);
        assert_eq!(source.num_examples(), 3);

        for _ in 0..2 {
            source.reset();
            let mut seen = 0;
            while let Some(batch) = source.next_batch()? {
                seen += batch.len();
            }
            assert_eq!(seen, 3);
        }

        Ok(())
    }

    #[test]
    fn test_place_batch() -> candle_core::Result<()> {
        let batch = toy_batch(&[2, 1], 3);
        let inputs = batch.place(&ComputeContext::cpu())?;
        assert_eq!(inputs.questions.dims(), &[2, 3]);
        assert_eq!(inputs.object_features.dims(), &[2, 2, 3]);
        assert_eq!(inputs.question_lens.to_vec1::<u32>()?, vec![2, 1]);
        Ok(())
    }
}
