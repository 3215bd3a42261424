/// Per-epoch learning rate schedule: warmup table, then step decay
use serde::{Deserialize, Serialize};

/// Schedule method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleMethod {
    /// Warmup table followed by step decay
    #[serde(rename = "warm_up")]
    WarmUp,
    /// Keep the optimizer's rate untouched
    #[serde(rename = "none")]
    None,
}

/// Which rule decides the rate for a given epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    /// Rate comes from the warmup table
    Warmup,
    /// Rate is multiplied by the decay factor
    Decay,
    /// Rate passes through unchanged
    Hold,
}

/// Step-decay scheduler configuration
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Learning rate for each warmup epoch
    pub warmup_rates: Vec<f64>,
    /// First epoch eligible for decay
    pub decay_start_epoch: usize,
    /// Epochs between decays
    pub decay_step: usize,
    /// Multiplicative decay factor
    pub decay_rate: f64,
    /// Decay epochs are bounded by the run length
    pub max_epochs: usize,
    pub method: ScheduleMethod,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_rates: Vec::new(),
            decay_start_epoch: 10,
            decay_step: 2,
            decay_rate: 0.5,
            max_epochs: 25,
            method: ScheduleMethod::WarmUp,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.decay_step == 0 {
            return Err(crate::TrainError::Config(
                "lr_decay_step must be > 0".to_string(),
            ));
        }
        if !(self.decay_rate > 0.0) {
            return Err(crate::TrainError::Config(format!(
                "lr_decay_rate must be > 0, got {}",
                self.decay_rate
            )));
        }
        Ok(())
    }

    /// Whether `epoch` is one of start, start + step, ... below `max_epochs`
    fn is_decay_epoch(&self, epoch: usize) -> bool {
        epoch >= self.decay_start_epoch
            && epoch < self.max_epochs
            && (epoch - self.decay_start_epoch) % self.decay_step == 0
    }
}

/// Warmup/step-decay learning rate scheduler
///
/// Stateless: the rate for an epoch depends only on the epoch, the
/// configuration and the rate the parameter group currently carries.
/// Warmup takes priority over decay while the epoch indexes the table.
#[derive(Debug, Clone)]
pub struct StepDecayScheduler {
    config: ScheduleConfig,
}

impl StepDecayScheduler {
    /// Create new scheduler
    pub fn new(config: ScheduleConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Rule in effect for `epoch`
    pub fn phase(&self, epoch: usize) -> SchedulePhase {
        if self.config.method != ScheduleMethod::WarmUp {
            SchedulePhase::Hold
        } else if epoch < self.config.warmup_rates.len() {
            SchedulePhase::Warmup
        } else if self.config.is_decay_epoch(epoch) {
            SchedulePhase::Decay
        } else {
            SchedulePhase::Hold
        }
    }

    /// New rate for a parameter group entering `epoch` with `current_rate`
    pub fn rate_for_group(&self, epoch: usize, current_rate: f64) -> f64 {
        match self.phase(epoch) {
            SchedulePhase::Warmup => self.config.warmup_rates[epoch],
            SchedulePhase::Decay => current_rate * self.config.decay_rate,
            SchedulePhase::Hold => current_rate,
        }
    }

    /// Rate at `epoch` for a run that started at `base_rate` in epoch 0
    pub fn rate_at(&self, epoch: usize, base_rate: f64) -> f64 {
        (0..=epoch).fold(base_rate, |rate, e| self.rate_for_group(e, rate))
    }
}
