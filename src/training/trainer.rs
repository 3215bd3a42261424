/// Epoch loop for question answering models
use std::path::PathBuf;

use candle_core::DType;
use candle_nn::{loss, VarMap};

use super::checkpoint::{restore_parameters, snapshot_parameters, Checkpoint, CheckpointManager};
use super::metrics::EpochMetrics;
use super::optimizer::{clip_grad_norm, Adam, AdamConfig};
use super::scheduler::{ScheduleConfig, StepDecayScheduler};
use super::validation::{batch_accuracy, Validator};
use crate::data::BatchSource;
use crate::device::ComputeContext;
use crate::models::{ModelArgs, QaModel};
use crate::ExperimentConfig;

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub max_epochs: usize,
    /// Learning rate every parameter group starts with
    pub learning_rate: f64,
    pub schedule: ScheduleConfig,
    /// Ceiling for the global gradient norm
    pub grad_clip: f64,
    /// Run validation (and therefore checkpointing) after every epoch
    pub validate: bool,
    /// Checkpoint file, overwritten on every improvement
    pub checkpoint_path: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_epochs: 25,
            learning_rate: 1e-4,
            schedule: ScheduleConfig::default(),
            grad_clip: 8.0,
            validate: true,
            checkpoint_path: PathBuf::from("ckpt/model.safetensors"),
        }
    }
}

impl TrainingConfig {
    pub fn from_experiment(config: &ExperimentConfig) -> Self {
        Self {
            max_epochs: config.train.max_epochs,
            learning_rate: config.train.lr,
            schedule: config.schedule(),
            grad_clip: config.train.grad_clip,
            validate: config.val.flag,
            checkpoint_path: config.layout().checkpoint_path(),
        }
    }
}

/// Progress of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// Next epoch to run
    pub epoch: usize,
    /// Best validation score so far; never decreases
    pub best_validation_score: f64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            best_validation_score: 0.0,
        }
    }
}

/// What happened in one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Learning rate of each parameter group during the epoch
    pub learning_rates: Vec<f64>,
    pub average_loss: f64,
    pub average_accuracy: f64,
    pub validation_score: Option<f64>,
    /// Whether a checkpoint was written at the end of the epoch
    pub saved: bool,
}

/// Drives epochs of training, validation and checkpointing for one model
pub struct Trainer<M: QaModel> {
    model: M,
    varmap: VarMap,
    model_args: ModelArgs,
    optimizer: Adam,
    scheduler: StepDecayScheduler,
    checkpoints: CheckpointManager,
    ctx: ComputeContext,
    config: TrainingConfig,
    state: TrainingState,
    history: Vec<EpochSummary>,
}

impl<M: QaModel> Trainer<M> {
    /// Create new trainer
    ///
    /// # Arguments
    /// * `model` - Model whose parameters are registered in `varmap`
    /// * `varmap` - Trainable parameters, all placed in one Adam group
    /// * `model_args` - Construction arguments, stored with every checkpoint
    pub fn new(
        model: M,
        varmap: VarMap,
        model_args: ModelArgs,
        config: TrainingConfig,
        ctx: ComputeContext,
    ) -> crate::Result<Self> {
        let optimizer = Adam::new(
            &varmap,
            AdamConfig {
                lr: config.learning_rate,
                ..AdamConfig::default()
            },
        )?;
        let scheduler = StepDecayScheduler::new(config.schedule.clone())?;
        let checkpoints = CheckpointManager::new(config.checkpoint_path.clone(), ctx.clone());

        Ok(Self {
            model,
            varmap,
            model_args,
            optimizer,
            scheduler,
            checkpoints,
            ctx,
            config,
            state: TrainingState::default(),
            history: Vec::new(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Summaries of the epochs run by this trainer, oldest first
    pub fn history(&self) -> &[EpochSummary] {
        &self.history
    }

    /// Resume from the experiment checkpoint
    ///
    /// Restores parameters, optimizer moments and group rates, and the best
    /// score. Training continues with the epoch after the saved one.
    pub fn restore(&mut self) -> crate::Result<()> {
        let checkpoint = self.checkpoints.load()?;

        if checkpoint.model_args != self.model_args {
            return Err(crate::TrainError::Config(format!(
                "checkpoint was written for {:?}, configured model is {:?}",
                checkpoint.model_args, self.model_args
            )));
        }

        restore_parameters(&self.varmap, &checkpoint.parameters)?;
        self.optimizer
            .load_state(&checkpoint.optimizer_meta, &checkpoint.optimizer_tensors)?;
        self.checkpoints.restore_best(checkpoint.best_score);
        self.state = TrainingState {
            epoch: checkpoint.epoch + 1,
            best_validation_score: checkpoint.best_score,
        };

        log::info!(
            "restored {} at epoch {} (best {:.4}), lr {:?}",
            self.checkpoints.path().display(),
            checkpoint.epoch,
            checkpoint.best_score,
            self.optimizer.group_rates()
        );

        Ok(())
    }

    /// Train until `max_epochs`, returning the best validation score
    ///
    /// Any error aborts the run immediately; nothing is saved for the failing epoch.
    pub fn run<S, V>(&mut self, train: &mut S, mut validator: Option<&mut V>) -> crate::Result<f64>
    where
        S: BatchSource + ?Sized,
        V: Validator + ?Sized,
    {
        log::info!(
            "Starting training at epoch {} of {}",
            self.state.epoch,
            self.config.max_epochs
        );
        log::info!(
            "{} batches ({} examples) per epoch",
            train.num_batches(),
            train.num_examples()
        );
        if validator.is_none() && self.config.validate {
            log::warn!("validation enabled but no validator given; no checkpoints will be written");
        }

        for epoch in self.state.epoch..self.config.max_epochs {
            for group in 0..self.optimizer.groups().len() {
                let current = self.optimizer.groups()[group].lr;
                self.optimizer
                    .set_group_rate(group, self.scheduler.rate_for_group(epoch, current));
            }
            let learning_rates = self.optimizer.group_rates();
            log::info!("Epoch {} lr: {:?}", epoch, learning_rates);

            let metrics = self.train_epoch(epoch, train)?;
            log::info!(
                "Epoch = {} avg_loss = {:.3} avg_acc = {:.3}",
                epoch,
                metrics.average_loss(),
                metrics.average_accuracy()
            );

            let mut validation_score = None;
            let mut saved = false;
            if self.config.validate {
                if let Some(v) = validator.as_mut() {
                    let score = v.validate(&self.model, &self.ctx)?;
                    validation_score = Some(score);
                    saved = self.checkpoint_if_improved(epoch, score)?;
                }
            }

            self.state = TrainingState {
                epoch: epoch + 1,
                best_validation_score: self.checkpoints.best_score(),
            };
            self.history.push(EpochSummary {
                epoch,
                learning_rates,
                average_loss: metrics.average_loss(),
                average_accuracy: metrics.average_accuracy(),
                validation_score,
                saved,
            });
        }

        log::info!(
            "Training complete, best validation score {:.4}",
            self.state.best_validation_score
        );
        Ok(self.state.best_validation_score)
    }

    /// One pass over `train`
    fn train_epoch<S: BatchSource + ?Sized>(
        &mut self,
        epoch: usize,
        train: &mut S,
    ) -> crate::Result<EpochMetrics> {
        let mut metrics = EpochMetrics::new();
        let num_batches = train.num_batches().max(1);
        let vars = self.optimizer.vars();

        train.reset();
        let mut index = 0;
        while let Some(mut batch) = train.next_batch()? {
            batch.validate()?;
            batch.sort_by_length();

            let inputs = batch.place(&self.ctx)?;
            let answers = self.ctx.place_u32(&batch.answers)?;

            let output = self.model.forward(&inputs, true)?;
            let loss = loss::cross_entropy(&output.logits, &answers)?;
            let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            if !loss_value.is_finite() {
                return Err(crate::TrainError::NumericInstability {
                    epoch,
                    batch: index,
                    loss: loss_value,
                });
            }

            let mut grads = loss.backward()?;
            let grad_norm = clip_grad_norm(&mut grads, &vars, self.config.grad_clip)?;
            self.optimizer.step(&grads)?;

            let accuracy = batch_accuracy(&output.logits.detach(), &answers)?;
            metrics.update(loss_value, accuracy, batch.len());

            log::debug!(
                "progress {:.3} loss = {:.4} acc = {:.3} grad_norm = {:.3}",
                epoch as f64 + index as f64 / num_batches as f64,
                loss_value,
                accuracy,
                grad_norm
            );
            index += 1;
        }

        if metrics.num_batches() == 0 {
            log::warn!("epoch {} saw no training batches", epoch);
        }
        Ok(metrics)
    }

    /// Save a checkpoint for `epoch` when `score` beats the best so far
    fn checkpoint_if_improved(&mut self, epoch: usize, score: f64) -> crate::Result<bool> {
        let varmap = &self.varmap;
        let optimizer = &self.optimizer;
        let model_args = &self.model_args;

        self.checkpoints.maybe_save(score, |best_score| {
            Ok(Checkpoint {
                epoch,
                best_score,
                model_args: model_args.clone(),
                parameters: snapshot_parameters(varmap)?,
                optimizer_meta: optimizer.state_meta(),
                optimizer_tensors: optimizer.state_tensors(),
            })
        })
    }
}
