/// Experiment configuration
///
/// Every option the training run recognises, loaded from a JSON file.
/// Missing fields fall back to the defaults below.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::training::scheduler::{ScheduleConfig, ScheduleMethod};

/// Top-level experiment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Experiment name, namespaces the output directory
    pub exp_name: String,
    /// Random seed for shuffling and device RNG
    pub seed: u64,
    /// CUDA device ordinal
    pub gpu_id: usize,
    /// Request multi-device execution
    pub multi_gpus: bool,
    /// Background batch-assembly workers (0 = inline)
    pub num_workers: usize,
    pub dataset: DatasetConfig,
    pub train: TrainConfig,
    pub val: ValConfig,
}

/// Dataset locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Root of all dataset files
    pub data_dir: PathBuf,
    /// Root of experiment outputs
    pub save_dir: PathBuf,
    /// Training split directory, relative to `data_dir`
    pub train_split: PathBuf,
    /// Validation split directory, relative to `data_dir`
    pub val_split: PathBuf,
    /// Vocabulary file, relative to `data_dir`
    pub vocab_json: PathBuf,
    /// Pretrained question embeddings (.npy), relative to `data_dir`
    pub glove_npy: Option<PathBuf>,
}

/// Optimisation options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Base learning rate
    pub lr: f64,
    /// Per-epoch warmup learning rates
    pub gradual_warmup_steps: Vec<f64>,
    pub epoch_decay_start: usize,
    pub lr_decay_step: usize,
    pub lr_decay_rate: f64,
    pub schedule_method: ScheduleMethod,
    /// Resume from the experiment checkpoint
    pub restore: bool,
    /// Object feature dimension
    pub vision_dim: usize,
    /// Number of reasoning steps in the network
    pub net_length: usize,
    pub hidden_size: usize,
    /// Initialise question embeddings from `dataset.glove_npy`
    pub glove: bool,
    /// Cap on training instances (0 = all)
    pub train_num: usize,
    /// Gradient norm ceiling
    pub grad_clip: f64,
}

/// Validation options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValConfig {
    /// Run validation after every epoch
    pub flag: bool,
    /// Cap on validation instances (0 = all)
    pub val_num: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            exp_name: "gqa".to_string(),
            seed: 666,
            gpu_id: 0,
            multi_gpus: false,
            num_workers: 4,
            dataset: DatasetConfig::default(),
            train: TrainConfig::default(),
            val: ValConfig::default(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/gqa"),
            save_dir: PathBuf::from("results"),
            train_split: PathBuf::from("train"),
            val_split: PathBuf::from("val"),
            vocab_json: PathBuf::from("vocab.json"),
            glove_npy: None,
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_epochs: 25,
            lr: 1e-4,
            gradual_warmup_steps: vec![0.25e-4, 0.5e-4, 0.75e-4, 1e-4],
            epoch_decay_start: 10,
            lr_decay_step: 2,
            lr_decay_rate: 0.5,
            schedule_method: ScheduleMethod::WarmUp,
            restore: false,
            vision_dim: 2048,
            net_length: 4,
            hidden_size: 512,
            glove: false,
            train_num: 0,
            grad_clip: 8.0,
        }
    }
}

impl Default for ValConfig {
    fn default() -> Self {
        Self {
            flag: true,
            val_num: 0,
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            crate::TrainError::Config(format!("cannot open config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.exp_name.trim().is_empty() {
            return Err(crate::TrainError::Config(
                "exp_name must not be empty".to_string(),
            ));
        }

        if self.train.batch_size == 0 || self.train.max_epochs == 0 {
            return Err(crate::TrainError::Config(
                "batch_size and max_epochs must be > 0".to_string(),
            ));
        }

        if !(self.train.lr > 0.0) {
            return Err(crate::TrainError::Config(format!(
                "lr must be > 0, got {}",
                self.train.lr
            )));
        }

        if self.train.gradual_warmup_steps.iter().any(|&r| !(r > 0.0)) {
            return Err(crate::TrainError::Config(
                "gradual_warmup_steps entries must be > 0".to_string(),
            ));
        }

        if !(self.train.grad_clip > 0.0) {
            return Err(crate::TrainError::Config(
                "grad_clip must be > 0".to_string(),
            ));
        }

        if self.train.glove && self.dataset.glove_npy.is_none() {
            return Err(crate::TrainError::Config(
                "train.glove is set but dataset.glove_npy is missing".to_string(),
            ));
        }

        self.schedule().validate()
    }

    /// Learning rate schedule derived from the train options
    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            warmup_rates: self.train.gradual_warmup_steps.clone(),
            decay_start_epoch: self.train.epoch_decay_start,
            decay_step: self.train.lr_decay_step,
            decay_rate: self.train.lr_decay_rate,
            max_epochs: self.train.max_epochs,
            method: self.train.schedule_method,
        }
    }

    /// Output layout for this experiment
    pub fn layout(&self) -> ExperimentLayout {
        ExperimentLayout::new(self.dataset.save_dir.join(&self.exp_name))
    }

    pub fn train_split_dir(&self) -> PathBuf {
        self.dataset.data_dir.join(&self.dataset.train_split)
    }

    pub fn val_split_dir(&self) -> PathBuf {
        self.dataset.data_dir.join(&self.dataset.val_split)
    }

    pub fn vocab_path(&self) -> PathBuf {
        self.dataset.data_dir.join(&self.dataset.vocab_json)
    }

    pub fn glove_path(&self) -> Option<PathBuf> {
        self.dataset
            .glove_npy
            .as_ref()
            .map(|p| self.dataset.data_dir.join(p))
    }
}

/// Directory layout of one experiment's outputs
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    root: PathBuf,
}

impl ExperimentLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("ckpt")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir().join("model.safetensors")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("stdout.log")
    }

    /// Create the experiment and log directories
    ///
    /// A restored run must find the log directory left by the run it resumes.
    pub fn prepare(&self, restore: bool) -> crate::Result<()> {
        std::fs::create_dir_all(&self.root)?;

        let log_dir = self.log_dir();
        if restore && !log_dir.is_dir() {
            return Err(crate::TrainError::Config(format!(
                "restore requested but {} does not exist",
                log_dir.display()
            )));
        }
        std::fs::create_dir_all(&log_dir)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExperimentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.train.grad_clip, 8.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "exp_name": "lognet_small",
            "train": { "batch_size": 32, "schedule_method": "none" }
        }"#;

        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.exp_name, "lognet_small");
        assert_eq!(config.train.batch_size, 32);
        assert_eq!(config.train.schedule_method, ScheduleMethod::None);
        assert_eq!(config.train.max_epochs, 25);
        assert!(config.val.flag);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ExperimentConfig::default();
        config.train.lr_decay_step = 0;
        assert!(matches!(config.validate(), Err(crate::TrainError::Config(_))));

        let mut config = ExperimentConfig::default();
        config.train.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.train.glove = true;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.exp_name = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layout_paths() {
        let mut config = ExperimentConfig::default();
        config.dataset.save_dir = PathBuf::from("/tmp/out");
        config.exp_name = "run1".to_string();

        let layout = config.layout();
        assert_eq!(layout.root(), Path::new("/tmp/out/run1"));
        assert_eq!(
            layout.checkpoint_path(),
            PathBuf::from("/tmp/out/run1/ckpt/model.safetensors")
        );
        assert_eq!(layout.log_file(), PathBuf::from("/tmp/out/run1/log/stdout.log"));
        assert_eq!(config.train_split_dir(), PathBuf::from("data/gqa/train"));
    }

    #[test]
    fn test_restore_requires_existing_log_dir() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = ExperimentLayout::new(tmp.path().join("exp"));

        assert!(layout.prepare(true).is_err());
        layout.prepare(false)?;
        assert!(layout.log_dir().is_dir());
        layout.prepare(true)?;

        Ok(())
    }
}
