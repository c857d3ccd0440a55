//! Backend abstraction - Multi-backend support
//!
//! Maps the device string given on the command line (`CPU`, `GPU`, `GPU.1`,
//! `CUDA`, ...) onto a Burn backend compiled into this build:
//! NdArray (CPU), Wgpu (GPU) or CUDA.

use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::utils::error::{AnomalyError, Result};

#[cfg(feature = "ndarray")]
pub type CpuBackend = burn_ndarray::NdArray<f32>;

#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;

#[cfg(feature = "cuda")]
pub type CudaBackend = burn_cuda::Cuda;

#[cfg(not(any(feature = "ndarray", feature = "wgpu", feature = "cuda")))]
compile_error!("At least one backend (ndarray, wgpu, or cuda) must be enabled!");

/// Target compute device requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    /// NdArray backend
    Cpu,
    /// Wgpu backend on the n-th discrete GPU
    Gpu(usize),
    /// CUDA backend on the n-th device
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(id) => write!(f, "GPU.{}", id),
            Device::Cuda(id) => write!(f, "CUDA.{}", id),
        }
    }
}

impl FromStr for Device {
    type Err = AnomalyError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let (kind, index) = match upper.split_once(['.', ':']) {
            Some((kind, idx)) => {
                let index = idx
                    .parse::<usize>()
                    .map_err(|_| AnomalyError::Device(format!("Invalid device index in '{}'", s)))?;
                (kind.to_string(), index)
            }
            None => (upper.clone(), 0),
        };

        match kind.as_str() {
            "CPU" => Ok(Device::Cpu),
            "GPU" => Ok(Device::Gpu(index)),
            "CUDA" => Ok(Device::Cuda(index)),
            _ => Err(AnomalyError::Device(format!(
                "Unknown device '{}' (expected CPU, GPU[.n] or CUDA[.n])",
                s
            ))),
        }
    }
}

impl Device {
    /// Human-readable backend name for this device
    pub fn backend_name(&self) -> &'static str {
        match self {
            Device::Cpu => "NdArray (CPU)",
            Device::Gpu(_) => "Wgpu (GPU)",
            Device::Cuda(_) => "CUDA (GPU)",
        }
    }
}

/// Work that is generic over the Burn backend.
///
/// Binaries implement this once and let [`dispatch`] pick the concrete
/// backend from the runtime device string.
pub trait BackendTask {
    type Output;

    fn run<B: Backend>(self, device: B::Device) -> Self::Output;
}

/// Run `task` on the backend selected by `device`
pub fn dispatch<T: BackendTask>(device: Device, task: T) -> Result<T::Output> {
    tracing::info!("Using device {} with backend {}", device, device.backend_name());

    match device {
        Device::Cpu => {
            #[cfg(feature = "ndarray")]
            {
                Ok(task.run::<CpuBackend>(burn_ndarray::NdArrayDevice::Cpu))
            }
            #[cfg(not(feature = "ndarray"))]
            {
                let _ = task;
                Err(not_compiled("CPU", "ndarray"))
            }
        }
        Device::Gpu(index) => {
            #[cfg(feature = "wgpu")]
            {
                Ok(task.run::<GpuBackend>(burn_wgpu::WgpuDevice::DiscreteGpu(index)))
            }
            #[cfg(not(feature = "wgpu"))]
            {
                let _ = (task, index);
                Err(not_compiled("GPU", "wgpu"))
            }
        }
        Device::Cuda(index) => {
            #[cfg(feature = "cuda")]
            {
                Ok(task.run::<CudaBackend>(burn_cuda::CudaDevice::new(index)))
            }
            #[cfg(not(feature = "cuda"))]
            {
                let _ = (task, index);
                Err(not_compiled("CUDA", "cuda"))
            }
        }
    }
}

#[allow(dead_code)]
fn not_compiled(device: &str, feature: &str) -> AnomalyError {
    AnomalyError::Device(format!(
        "{} device requested but this build lacks the '{}' feature (rebuild with --features {})",
        device, feature, feature
    ))
}
