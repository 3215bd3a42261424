/// Training checkpoints with safetensors
///
/// One file per experiment holds the model parameters (`model.<name>`), the
/// Adam moments (`optim.m.<name>`, `optim.v.<name>`) and, in the header
/// metadata, the epoch, best validation score, model arguments and optimizer
/// bookkeeping. The file is replaced atomically on every save.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use serde::de::DeserializeOwned;

use super::optimizer::AdamStateMeta;
use crate::device::ComputeContext;
use crate::models::ModelArgs;

const FORMAT_VERSION: &str = "1";
const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";

/// Snapshot of everything needed to resume training
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Last completed epoch
    pub epoch: usize,
    /// Best validation score when the snapshot was taken
    pub best_score: f64,
    pub model_args: ModelArgs,
    /// Model parameters by name
    pub parameters: HashMap<String, Tensor>,
    pub optimizer_meta: AdamStateMeta,
    /// Optimizer moment tensors by name
    pub optimizer_tensors: HashMap<String, Tensor>,
}

fn io_error(path: &Path, what: &str, e: impl std::fmt::Display) -> crate::TrainError {
    crate::TrainError::CheckpointIo(format!("{} {}: {}", what, path.display(), e))
}

fn field<T: DeserializeOwned>(
    metadata: &HashMap<String, String>,
    key: &str,
    path: &Path,
) -> crate::Result<T> {
    let raw = metadata
        .get(key)
        .ok_or_else(|| io_error(path, "corrupt checkpoint", format!("missing {}", key)))?;
    serde_json::from_str(raw).map_err(|e| io_error(path, "corrupt checkpoint", format!("{}: {}", key, e)))
}

impl Checkpoint {
    /// Save checkpoint to file
    ///
    /// Writes a temporary sibling first and renames it over `path`, so a
    /// failed save never leaves a truncated checkpoint behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();

        let mut tensors: HashMap<String, &Tensor> =
            HashMap::with_capacity(self.parameters.len() + self.optimizer_tensors.len());
        for (name, tensor) in &self.parameters {
            tensors.insert(format!("{}{}", MODEL_PREFIX, name), tensor);
        }
        for (name, tensor) in &self.optimizer_tensors {
            tensors.insert(format!("{}{}", OPTIM_PREFIX, name), tensor);
        }

        let mut metadata = HashMap::new();
        metadata.insert("format_version".to_string(), serde_json::to_string(FORMAT_VERSION)?);
        metadata.insert("epoch".to_string(), serde_json::to_string(&self.epoch)?);
        metadata.insert("best_score".to_string(), serde_json::to_string(&self.best_score)?);
        metadata.insert("model_args".to_string(), serde_json::to_string(&self.model_args)?);
        metadata.insert("optimizer".to_string(), serde_json::to_string(&self.optimizer_meta)?);

        let tmp = path.with_extension("safetensors.tmp");
        safetensors::serialize_to_file(tensors, &Some(metadata), &tmp)
            .map_err(|e| io_error(&tmp, "cannot write checkpoint", e))?;
        std::fs::rename(&tmp, path).map_err(|e| io_error(path, "cannot replace checkpoint", e))?;

        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    /// * `device` - Device to load tensors on
    ///
    /// Missing, truncated or foreign files fail with `TrainError::CheckpointIo`.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| io_error(path, "cannot read checkpoint", e))?;

        let (_, header) = SafeTensors::read_metadata(&bytes)
            .map_err(|e| io_error(path, "corrupt checkpoint", e))?;
        let metadata = header
            .metadata()
            .clone()
            .ok_or_else(|| io_error(path, "corrupt checkpoint", "no metadata"))?;

        let version: String = field(&metadata, "format_version", path)?;
        if version != FORMAT_VERSION {
            return Err(io_error(
                path,
                "unsupported checkpoint",
                format!("format version {}", version),
            ));
        }

        let loaded = candle_core::safetensors::load_buffer(&bytes, device)
            .map_err(|e| io_error(path, "corrupt checkpoint", e))?;

        let mut parameters = HashMap::new();
        let mut optimizer_tensors = HashMap::new();
        for (name, tensor) in loaded {
            if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
                parameters.insert(param.to_string(), tensor);
            } else if let Some(state) = name.strip_prefix(OPTIM_PREFIX) {
                optimizer_tensors.insert(state.to_string(), tensor);
            } else {
                return Err(io_error(path, "corrupt checkpoint", format!("unexpected tensor {}", name)));
            }
        }

        Ok(Self {
            epoch: field(&metadata, "epoch", path)?,
            best_score: field(&metadata, "best_score", path)?,
            model_args: field(&metadata, "model_args", path)?,
            parameters,
            optimizer_meta: field(&metadata, "optimizer", path)?,
            optimizer_tensors,
        })
    }
}

/// Copy every parameter of `varmap`
pub fn snapshot_parameters(varmap: &VarMap) -> crate::Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| crate::TrainError::Training("parameter map lock poisoned".to_string()))?;

    let mut tensors = HashMap::with_capacity(data.len());
    for (name, var) in data.iter() {
        tensors.insert(name.clone(), var.as_tensor().copy()?);
    }
    Ok(tensors)
}

/// Write saved parameters into `varmap`, which must hold exactly the same names and shapes
pub fn restore_parameters(varmap: &VarMap, parameters: &HashMap<String, Tensor>) -> crate::Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| crate::TrainError::Training("parameter map lock poisoned".to_string()))?;

    if data.len() != parameters.len() {
        return Err(crate::TrainError::CheckpointIo(format!(
            "checkpoint has {} parameters, model has {}",
            parameters.len(),
            data.len()
        )));
    }

    for (name, var) in data.iter() {
        let saved = parameters.get(name).ok_or_else(|| {
            crate::TrainError::CheckpointIo(format!("checkpoint is missing parameter {}", name))
        })?;
        if saved.dims() != var.dims() {
            return Err(crate::TrainError::CheckpointIo(format!(
                "parameter {} has shape {:?} in checkpoint, {:?} in model",
                name,
                saved.dims(),
                var.dims()
            )));
        }
        var.set(&saved.to_dtype(var.dtype())?)?;
    }

    Ok(())
}

/// Best validation score seen so far
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestScore {
    best: f64,
}

impl Default for BestScore {
    fn default() -> Self {
        Self { best: 0.0 }
    }
}

impl BestScore {
    pub fn new(initial: f64) -> Self {
        Self { best: initial }
    }

    pub fn value(&self) -> f64 {
        self.best
    }

    /// Whether `score` strictly beats the best so far
    pub fn improves(&self, score: f64) -> bool {
        score > self.best
    }

    /// Record `score`; true only on strict improvement
    pub fn observe(&mut self, score: f64) -> bool {
        if self.improves(score) {
            self.best = score;
            true
        } else {
            false
        }
    }
}

/// Owns the experiment checkpoint file and the best-so-far score
///
/// Saves are synchronous and must come from the single training thread.
pub struct CheckpointManager {
    path: PathBuf,
    ctx: ComputeContext,
    best: BestScore,
    saves: usize,
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(path: P, ctx: ComputeContext) -> Self {
        Self {
            path: path.into(),
            ctx,
            best: BestScore::default(),
            saves: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_score(&self) -> f64 {
        self.best.value()
    }

    /// Number of checkpoints written by this manager
    pub fn num_saves(&self) -> usize {
        self.saves
    }

    /// Seed the best score, e.g. from a restored checkpoint
    pub fn restore_best(&mut self, score: f64) {
        self.best = BestScore::new(score);
    }

    /// Persist `checkpoint`, replacing any previous one
    pub fn save(&mut self, checkpoint: &Checkpoint) -> crate::Result<PathBuf> {
        // Device work must finish before tensors are read back for serialization
        self.ctx.synchronize()?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_error(dir, "cannot create", e))?;
        }
        checkpoint.save(&self.path)?;
        self.saves += 1;

        log::info!(
            ">>>>>> saved epoch {} (score {:.4}) to {} <<<<<<",
            checkpoint.epoch,
            checkpoint.best_score,
            self.path.display()
        );

        Ok(self.path.clone())
    }

    /// Save a checkpoint built by `build` if `score` beats the best so far
    ///
    /// `build` receives the new best score. Returns whether a checkpoint was written.
    /// The best score only moves once the checkpoint is on disk.
    pub fn maybe_save<F>(&mut self, score: f64, build: F) -> crate::Result<bool>
    where
        F: FnOnce(f64) -> crate::Result<Checkpoint>,
    {
        if !self.best.improves(score) {
            return Ok(false);
        }
        let checkpoint = build(score)?;
        self.save(&checkpoint)?;
        self.best = BestScore::new(score);
        Ok(true)
    }

    /// Load the experiment checkpoint
    pub fn load(&self) -> crate::Result<Checkpoint> {
        Checkpoint::load(&self.path, self.ctx.device())
    }
}
