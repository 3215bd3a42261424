/// Compute context: the device every tensor of a run is placed on
use candle_core::{DType, Device, Result, Tensor};
use ndarray::{Array, Dimension};

use crate::ExperimentConfig;

/// Explicit device handle passed to every component that touches tensors
#[derive(Debug, Clone)]
pub struct ComputeContext {
    device: Device,
}

impl ComputeContext {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// Select and seed the device for a run
    ///
    /// Uses CUDA device `gpu_id` when CUDA is available, otherwise the CPU.
    /// Fails at startup if the requested CUDA device cannot be opened.
    pub fn from_config(config: &ExperimentConfig) -> crate::Result<Self> {
        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(config.gpu_id)?
        } else {
            Device::Cpu
        };

        if config.multi_gpus {
            log::warn!("multi_gpus requested; data-parallel execution is not supported, training on {:?}", device);
        }

        // The CPU backend draws from the thread rng and cannot be seeded
        if device.is_cuda() {
            device.set_seed(config.seed)?;
        } else {
            log::debug!("CPU device: seed {} applies to data shuffling only", config.seed);
        }
        log::info!("device: {:?}", device);

        Ok(Self { device })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Copy a host array to the device as f32
    pub fn place_f32<D: Dimension>(&self, array: &Array<f32, D>) -> Result<Tensor> {
        let shape = array.shape().to_vec();
        let data: Vec<f32> = array.iter().copied().collect();
        Tensor::from_vec(data, shape, &self.device)
    }

    /// Copy a host array to the device as u32
    pub fn place_u32<D: Dimension>(&self, array: &Array<u32, D>) -> Result<Tensor> {
        let shape = array.shape().to_vec();
        let data: Vec<u32> = array.iter().copied().collect();
        Tensor::from_vec(data, shape, &self.device)?.to_dtype(DType::U32)
    }

    /// Wait for all queued device work to finish
    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()
    }
}
