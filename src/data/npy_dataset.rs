/// GQA split stored as NumPy .npy files plus a JSON vocabulary
///
/// Expected split directory layout:
///
/// ```text
/// questions.npy         i64 [N, max_len]   padded question tokens
/// question_lens.npy     i64 [N]
/// answers.npy           i64 [N]
/// image_index.npy       i64 [N]            row into the feature arrays
/// object_features.npy   f32 [M, K, D]
/// spatial_features.npy  f32 [M, K, S]
/// question_ids.npy      i64 [N]            optional
/// image_ids.json        [M] strings        optional
/// ```
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use ndarray::{Array, Array1, Array2, Array3, Axis, Dimension};
use ndarray_npy::ReadNpyExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{Batch, BatchSource};

/// Question and answer vocabularies
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Vocab {
    pub question_token_to_idx: HashMap<String, u32>,
    pub answer_token_to_idx: HashMap<String, u32>,
}

impl Vocab {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            crate::TrainError::Config(format!("cannot open vocabulary {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn num_question_tokens(&self) -> usize {
        self.question_token_to_idx.len()
    }

    pub fn num_answers(&self) -> usize {
        self.answer_token_to_idx.len()
    }
}

/// One split loaded into memory
pub struct NpyQaDataset {
    questions: Array2<u32>,
    question_lens: Array1<u32>,
    answers: Array1<u32>,
    image_index: Array1<u32>,
    question_ids: Vec<u64>,
    image_ids: Vec<String>,
    object_features: Array3<f32>,
    spatial_features: Array3<f32>,
}

fn read_npy<T, P>(path: P) -> crate::Result<T>
where
    T: ReadNpyExt,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        crate::TrainError::Config(format!("cannot open {}: {}", path.display(), e))
    })?;
    Ok(T::read_npy(file)?)
}

/// Narrow NumPy int64 data to u32, rejecting values out of range
fn narrow<D: Dimension>(array: Array<i64, D>, name: &str) -> crate::Result<Array<u32, D>> {
    if let Some(&bad) = array.iter().find(|&&x| u32::try_from(x).is_err()) {
        return Err(crate::TrainError::DataShape(format!(
            "{} contains out-of-range value {}",
            name, bad
        )));
    }
    Ok(array.mapv(|x| x as u32))
}

impl NpyQaDataset {
    /// Load a split directory and check it against the vocabulary
    pub fn from_directory<P: AsRef<Path>>(path: P, vocab: &Vocab) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading split from: {:?}", dir);

        let questions = narrow(read_npy::<Array2<i64>, _>(dir.join("questions.npy"))?, "questions")?;
        let question_lens = narrow(
            read_npy::<Array1<i64>, _>(dir.join("question_lens.npy"))?,
            "question_lens",
        )?;
        let answers = narrow(read_npy::<Array1<i64>, _>(dir.join("answers.npy"))?, "answers")?;
        let image_index = narrow(
            read_npy::<Array1<i64>, _>(dir.join("image_index.npy"))?,
            "image_index",
        )?;
        let object_features: Array3<f32> = read_npy(dir.join("object_features.npy"))?;
        let spatial_features: Array3<f32> = read_npy(dir.join("spatial_features.npy"))?;

        let n = questions.nrows();

        let question_ids_path = dir.join("question_ids.npy");
        let question_ids: Vec<u64> = if question_ids_path.exists() {
            read_npy::<Array1<i64>, _>(&question_ids_path)?
                .iter()
                .map(|&x| {
                    u64::try_from(x).map_err(|_| {
                        crate::TrainError::DataShape(format!(
                            "question_ids contains out-of-range value {}",
                            x
                        ))
                    })
                })
                .collect::<crate::Result<_>>()?
        } else {
            (0..n as u64).collect()
        };

        let num_images = object_features.len_of(Axis(0));
        let image_ids_path = dir.join("image_ids.json");
        let image_ids: Vec<String> = if image_ids_path.exists() {
            serde_json::from_reader(BufReader::new(File::open(&image_ids_path)?))?
        } else {
            (0..num_images).map(|i| i.to_string()).collect()
        };

        let dataset = Self {
            questions,
            question_lens,
            answers,
            image_index,
            question_ids,
            image_ids,
            object_features,
            spatial_features,
        };
        dataset.check(vocab)?;

        log::info!(
            "Split loaded: {} questions over {} images, {} objects x {} dims",
            dataset.len(),
            num_images,
            dataset.object_features.len_of(Axis(1)),
            dataset.vision_dim()
        );

        Ok(dataset)
    }

    fn check(&self, vocab: &Vocab) -> crate::Result<()> {
        let n = self.questions.nrows();
        for (name, len) in [
            ("question_lens", self.question_lens.len()),
            ("answers", self.answers.len()),
            ("image_index", self.image_index.len()),
            ("question_ids", self.question_ids.len()),
        ] {
            if len != n {
                return Err(crate::TrainError::DataShape(format!(
                    "{} has {} entries, questions has {}",
                    name, len, n
                )));
            }
        }

        let num_images = self.object_features.len_of(Axis(0));
        if self.spatial_features.len_of(Axis(0)) != num_images
            || self.spatial_features.len_of(Axis(1)) != self.object_features.len_of(Axis(1))
        {
            return Err(crate::TrainError::DataShape(format!(
                "spatial features {:?} do not align with object features {:?}",
                self.spatial_features.shape(),
                self.object_features.shape()
            )));
        }
        if self.image_ids.len() != num_images {
            return Err(crate::TrainError::DataShape(format!(
                "image_ids has {} entries, features have {}",
                self.image_ids.len(),
                num_images
            )));
        }
        if let Some(&bad) = self.image_index.iter().find(|&&i| i as usize >= num_images) {
            return Err(crate::TrainError::DataShape(format!(
                "image index {} out of range for {} images",
                bad, num_images
            )));
        }

        let num_answers = vocab.num_answers() as u32;
        if let Some(&bad) = self.answers.iter().find(|&&a| a >= num_answers) {
            return Err(crate::TrainError::DataShape(format!(
                "answer {} outside answer vocabulary of {}",
                bad, num_answers
            )));
        }

        Ok(())
    }

    /// Get number of questions
    pub fn len(&self) -> usize {
        self.questions.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.nrows() == 0
    }

    /// Object feature dimension
    pub fn vision_dim(&self) -> usize {
        self.object_features.len_of(Axis(2))
    }

    pub fn spatial_dim(&self) -> usize {
        self.spatial_features.len_of(Axis(2))
    }

    /// Gather the examples at `indices` into a batch
    pub fn batch(&self, indices: &[usize]) -> Batch {
        let rows: Vec<usize> = indices
            .iter()
            .map(|&i| self.image_index[i] as usize)
            .collect();

        Batch {
            question_ids: indices.iter().map(|&i| self.question_ids[i]).collect(),
            image_ids: rows.iter().map(|&r| self.image_ids[r].clone()).collect(),
            answers: self.answers.select(Axis(0), indices),
            questions: self.questions.select(Axis(0), indices),
            object_features: self.object_features.select(Axis(0), &rows),
            spatial_features: self.spatial_features.select(Axis(0), &rows),
            question_lens: self.question_lens.select(Axis(0), indices),
        }
    }
}

/// Batches of the current pass
enum Pass {
    Inline { cursor: usize },
    Prefetch {
        rx: Receiver<Batch>,
        producer: JoinHandle<()>,
        /// Batches handed out so far in this pass
        received: usize,
    },
    /// Prefetch mode, producer not started yet
    Pending,
}

/// Data loader over an `NpyQaDataset`
///
/// With `num_workers > 0` batches are assembled on a background thread and
/// handed over through a queue holding at most `2 * num_workers` batches.
pub struct NpyQaLoader {
    dataset: Arc<NpyQaDataset>,
    batch_size: usize,
    indices: Vec<usize>,
    shuffle: bool,
    num_workers: usize,
    rng: StdRng,
    pass: Pass,
}

impl NpyQaLoader {
    /// Create new data loader over the first `limit` examples (0 = all)
    pub fn new(
        dataset: Arc<NpyQaDataset>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        num_workers: usize,
        limit: usize,
    ) -> Self {
        let num_samples = if limit == 0 {
            dataset.len()
        } else {
            limit.min(dataset.len())
        };

        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            indices: (0..num_samples).collect(),
            shuffle,
            num_workers,
            rng: StdRng::seed_from_u64(seed),
            pass: Pass::Pending,
        };
        loader.reset();
        loader
    }

    /// Get dataset reference
    pub fn dataset(&self) -> &NpyQaDataset {
        &self.dataset
    }

    fn start_prefetch(&mut self) -> (Receiver<Batch>, JoinHandle<()>) {
        let (tx, rx) = mpsc::sync_channel(2 * self.num_workers);
        let dataset = Arc::clone(&self.dataset);
        let indices = self.indices.clone();
        let batch_size = self.batch_size;

        let producer = std::thread::spawn(move || {
            for chunk in indices.chunks(batch_size) {
                // The receiver is gone once the pass is abandoned
                if tx.send(dataset.batch(chunk)).is_err() {
                    break;
                }
            }
        });

        (rx, producer)
    }

    fn stop_prefetch(&mut self) {
        if let Pass::Prefetch { rx, producer, .. } = std::mem::replace(&mut self.pass, Pass::Pending) {
            drop(rx);
            if producer.join().is_err() {
                log::warn!("batch producer thread panicked");
            }
        }
    }
}

impl BatchSource for NpyQaLoader {
    fn next_batch(&mut self) -> crate::Result<Option<Batch>> {
        if let Pass::Pending = self.pass {
            let (rx, producer) = self.start_prefetch();
            self.pass = Pass::Prefetch {
                rx,
                producer,
                received: 0,
            };
        }
        let expected = self.num_batches();

        match &mut self.pass {
            Pass::Inline { cursor } => {
                if *cursor >= self.indices.len() {
                    return Ok(None);
                }
                let end = (*cursor + self.batch_size).min(self.indices.len());
                let batch = self.dataset.batch(&self.indices[*cursor..end]);
                *cursor = end;
                Ok(Some(batch))
            }
            Pass::Prefetch { rx, received, .. } => match rx.recv() {
                Ok(batch) => {
                    *received += 1;
                    Ok(Some(batch))
                }
                // A producer that hangs up early has died mid-pass
                Err(_) if *received < expected => Err(crate::TrainError::Training(format!(
                    "batch producer stopped after {} of {} batches",
                    received, expected
                ))),
                Err(_) => Ok(None),
            },
            Pass::Pending => Ok(None),
        }
    }

    /// Reset loader for new epoch
    fn reset(&mut self) {
        self.stop_prefetch();

        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }

        self.pass = if self.num_workers == 0 {
            Pass::Inline { cursor: 0 }
        } else {
            Pass::Pending
        };
    }

    fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    fn num_examples(&self) -> usize {
        self.indices.len()
    }
}

impl Drop for NpyQaLoader {
    fn drop(&mut self) {
        self.stop_prefetch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_npy::WriteNpyExt;

    fn write<T: WriteNpyExt>(dir: &Path, name: &str, value: &T) {
        value.write_npy(File::create(dir.join(name)).unwrap()).unwrap();
    }

    fn vocab(num_answers: usize) -> Vocab {
        Vocab {
            question_token_to_idx: (0..10).map(|i| (format!("q{}", i), i)).collect(),
            answer_token_to_idx: (0..num_answers as u32).map(|i| (format!("a{}", i), i)).collect(),
        }
    }

    /// Five questions over two images
    fn write_split(dir: &Path) {
        write(dir, "questions.npy", &array![
            [1i64, 2, 0, 0],
            [3, 4, 5, 0],
            [6, 0, 0, 0],
            [7, 8, 9, 1],
            [2, 3, 0, 0]
        ]);
        write(dir, "question_lens.npy", &array![2i64, 3, 1, 4, 2]);
        write(dir, "answers.npy", &array![0i64, 1, 2, 1, 0]);
        write(dir, "image_index.npy", &array![0i64, 1, 1, 0, 1]);
        write(dir, "object_features.npy", &Array3::<f32>::from_shape_fn((2, 3, 4), |(i, _, _)| i as f32));
        write(dir, "spatial_features.npy", &Array3::<f32>::zeros((2, 3, 5)));
    }

    #[test]
    fn test_vocab_deserialization() {
        let json = r#"{
            "question_token_to_idx": {"<NULL>": 0, "what": 1},
            "answer_token_to_idx": {"yes": 0, "no": 1, "red": 2}
        }"#;
        let vocab: Vocab = serde_json::from_str(json).unwrap();
        assert_eq!(vocab.num_question_tokens(), 2);
        assert_eq!(vocab.num_answers(), 3);
    }

    #[test]
    fn test_load_and_batch() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_split(tmp.path());

        let dataset = NpyQaDataset::from_directory(tmp.path(), &vocab(3))?;
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.vision_dim(), 4);
        assert_eq!(dataset.spatial_dim(), 5);

        let batch = dataset.batch(&[1, 3]);
        batch.validate()?;
        assert_eq!(batch.answers.to_vec(), vec![1, 1]);
        assert_eq!(batch.image_ids, vec!["1", "0"]);
        assert_eq!(batch.object_features[[0, 0, 0]], 1.0);
        assert_eq!(batch.object_features[[1, 2, 3]], 0.0);

        Ok(())
    }

    #[test]
    fn test_answer_outside_vocab_rejected() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_split(tmp.path());

        let result = NpyQaDataset::from_directory(tmp.path(), &vocab(2));
        assert!(matches!(result, Err(crate::TrainError::DataShape(_))));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = NpyQaDataset::from_directory(tmp.path(), &vocab(3));
        assert!(matches!(result, Err(crate::TrainError::Config(_))));
    }

    fn collect_ids(loader: &mut NpyQaLoader) -> crate::Result<Vec<u64>> {
        let mut ids = Vec::new();
        while let Some(batch) = loader.next_batch()? {
            assert!(batch.len() <= 2);
            ids.extend(batch.question_ids);
        }
        Ok(ids)
    }

    #[test]
    fn test_loader_limit_and_batches() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_split(tmp.path());
        let dataset = Arc::new(NpyQaDataset::from_directory(tmp.path(), &vocab(3))?);

        let mut loader = NpyQaLoader::new(Arc::clone(&dataset), 2, false, 0, 0, 4);
        assert_eq!(loader.num_examples(), 4);
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(collect_ids(&mut loader)?, vec![0, 1, 2, 3]);

        // Exhausted until reset
        assert!(loader.next_batch()?.is_none());
        loader.reset();
        assert_eq!(collect_ids(&mut loader)?, vec![0, 1, 2, 3]);

        Ok(())
    }

    #[test]
    fn test_prefetch_matches_inline_order() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_split(tmp.path());
        let dataset = Arc::new(NpyQaDataset::from_directory(tmp.path(), &vocab(3))?);

        let mut inline = NpyQaLoader::new(Arc::clone(&dataset), 2, true, 7, 0, 0);
        let mut prefetch = NpyQaLoader::new(Arc::clone(&dataset), 2, true, 7, 2, 0);

        for _ in 0..3 {
            let a = collect_ids(&mut inline)?;
            let b = collect_ids(&mut prefetch)?;
            assert_eq!(a, b);

            let mut sorted = a.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3, 4]);

            inline.reset();
            prefetch.reset();
        }

        Ok(())
    }

    #[test]
    fn test_producer_dying_mid_pass_is_an_error() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_split(tmp.path());
        let dataset = Arc::new(NpyQaDataset::from_directory(tmp.path(), &vocab(3))?);

        let mut loader = NpyQaLoader::new(Arc::clone(&dataset), 2, false, 0, 1, 0);
        assert_eq!(loader.num_batches(), 3);

        // Producer hands over one batch, then panics
        let (tx, rx) = mpsc::sync_channel(2);
        let first = dataset.batch(&[0, 1]);
        let producer = std::thread::spawn(move || {
            let _ = tx.send(first);
            panic!("feature decoding failed");
        });
        loader.pass = Pass::Prefetch {
            rx,
            producer,
            received: 0,
        };

        assert!(loader.next_batch()?.is_some());
        assert!(matches!(loader.next_batch(), Err(crate::TrainError::Training(_))));

        // The next pass starts a healthy producer
        loader.reset();
        assert_eq!(collect_ids(&mut loader)?, vec![0, 1, 2, 3, 4]);

        Ok(())
    }

    #[test]
    fn test_negative_question_id_rejected() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_split(tmp.path());
        write(tmp.path(), "question_ids.npy", &array![10i64, 11, -1, 13, 14]);

        let result = NpyQaDataset::from_directory(tmp.path(), &vocab(3));
        assert!(matches!(result, Err(crate::TrainError::DataShape(_))));
        Ok(())
    }

    #[test]
    fn test_abandoned_prefetch_pass() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_split(tmp.path());
        let dataset = Arc::new(NpyQaDataset::from_directory(tmp.path(), &vocab(3))?);

        let mut loader = NpyQaLoader::new(dataset, 1, false, 0, 1, 0);
        assert!(loader.next_batch()?.is_some());
        loader.reset();
        assert_eq!(collect_ids(&mut loader)?, vec![0, 1, 2, 3, 4]);

        Ok(())
    }
}
