//! Process identity within a data-parallel run and the gradient reduction seam.

use candle_core::{
    backprop::GradStore,
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};

use crate::{config::DevicePreference, TrainingError};

/// Captured once at process start; never re-read from the environment afterwards.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub device: Device,
}

impl WorkerContext {
    /// Reads `RANK`, `WORLD_SIZE` and `LOCAL_RANK`; a process launched without
    /// them is a single worker.
    pub fn from_env(preference: DevicePreference, seed: u64) -> Result<Self, TrainingError> {
        let rank = env_usize("RANK")?;
        let world_size = env_usize("WORLD_SIZE")?;
        let local_rank = env_usize("LOCAL_RANK")?;

        let (rank, world_size, local_rank) = match (rank, world_size) {
            (Some(rank), Some(world_size)) => {
                if rank >= world_size {
                    return Err(TrainingError::initialization(format!(
                        "RANK {rank} is out of range for WORLD_SIZE {world_size}"
                    )));
                }
                (rank, world_size, local_rank.unwrap_or(rank))
            }
            _ => {
                log::info!("distributed environment not set, running as a single worker");
                (0, 1, 0)
            }
        };

        let device = select_device(preference, local_rank);
        if let Err(err) = device.set_seed(seed.wrapping_add(rank as u64)) {
            log::warn!("failed to seed device RNG: {}", err);
        }

        Ok(Self {
            rank,
            local_rank,
            world_size,
            device,
        })
    }

    pub fn single(device: Device) -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
            device,
        }
    }

    /// Rank zero owns the EMA shadow, checkpoints and samples.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, TrainingError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<usize>().map(Some).map_err(|err| {
            TrainingError::initialization(format!("invalid {name}='{value}': {err}"))
        }),
        Err(_) => Ok(None),
    }
}

pub fn select_device(preference: DevicePreference, ordinal: usize) -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    log::debug!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available,
        metal_available
    );

    let wants_metal = matches!(preference, DevicePreference::Metal)
        || (matches!(preference, DevicePreference::Auto) && metal_available);
    let wants_cuda = matches!(preference, DevicePreference::Cuda)
        || (matches!(preference, DevicePreference::Auto) && cuda_available);

    if wants_metal {
        match Device::new_metal(ordinal) {
            Ok(device) => {
                log::info!("device: using Metal GPU #{ordinal}");
                return device;
            }
            Err(err) => {
                log::warn!("failed to initialize metal device, falling back to CPU: {err}")
            }
        }
    } else if wants_cuda {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #{ordinal}");
                return device;
            }
            Err(err) => {
                log::warn!("failed to initialize cuda device, falling back to CPU: {err}")
            }
        }
    }
    log::info!("device: using CPU");
    Device::Cpu
}

/// Combines gradients across workers before the optimizer sees them.
pub trait GradientReducer: Send {
    fn all_reduce(&self, grads: &mut GradStore, parameters: &[Tensor])
        -> Result<(), TrainingError>;

    /// Step loss every worker agrees on. The stability guard only ever sees this
    /// value, so all replicas commit or roll back together.
    fn reduce_loss(&self, loss: f64) -> Result<f64, TrainingError> {
        Ok(loss)
    }
}

/// Reduction for a single process: gradients are already complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalReducer;

impl GradientReducer for LocalReducer {
    fn all_reduce(
        &self,
        _grads: &mut GradStore,
        _parameters: &[Tensor],
    ) -> Result<(), TrainingError> {
        Ok(())
    }
}
