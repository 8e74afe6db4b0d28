//! Compute device selection with a CPU fallback.

use burn::backend::ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
use burn::backend::wgpu::{Wgpu, WgpuDevice};

/// Backend used when no accelerator is available.
pub type CpuBackend = NdArray<f32>;

#[cfg(feature = "wgpu")]
pub type GpuBackend = Wgpu;

/// Device every tensor of a run is placed on.
#[derive(Clone, Debug)]
pub enum SelectedDevice {
    Cpu(NdArrayDevice),
    #[cfg(feature = "wgpu")]
    Gpu(WgpuDevice),
}

impl SelectedDevice {
    /// The GPU when it is compiled in and answers a probe, the CPU otherwise.
    pub fn select(force_cpu: bool) -> Self {
        if force_cpu {
            log::info!("Using the CPU as requested");
            return Self::cpu();
        }

        #[cfg(feature = "wgpu")]
        match probe_gpu() {
            Ok(device) => {
                log::info!("Using GPU device {device:?}");
                return Self::Gpu(device);
            }
            Err(reason) => {
                log::warn!("GPU unavailable ({reason}), falling back to the CPU");
            }
        }

        #[cfg(not(feature = "wgpu"))]
        log::warn!("Built without GPU support, training on the CPU will be slow");

        Self::cpu()
    }

    pub fn cpu() -> Self {
        Self::Cpu(NdArrayDevice::Cpu)
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu(_))
    }
}

impl core::fmt::Display for SelectedDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Cpu(_) => write!(f, "cpu"),
            #[cfg(feature = "wgpu")]
            Self::Gpu(device) => write!(f, "gpu ({device:?})"),
        }
    }
}

/// Run a small tensor round trip on the default GPU.
///
/// Adapter lookup panics when no GPU is present, the panic is turned into an error.
#[cfg(feature = "wgpu")]
fn probe_gpu() -> core::result::Result<WgpuDevice, String> {
    use burn::prelude::*;

    std::panic::catch_unwind(|| {
        let device = WgpuDevice::default();
        let sum = Tensor::<GpuBackend, 1>::from_floats([1.0, 2.0], &device)
            .sum()
            .into_scalar()
            .elem::<f32>();

        (device, sum)
    })
    .map_err(|_| "adapter initialization panicked".to_string())
    .and_then(|(device, sum)| match sum == 3.0 {
        true => Ok(device),
        false => Err(format!("probe returned {sum}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_cpu_is_honored() {
        let device = SelectedDevice::select(true);

        assert!(device.is_cpu());
        assert_eq!(device.to_string(), "cpu");
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn cpu_is_the_only_choice_without_gpu_support() {
        assert!(SelectedDevice::select(false).is_cpu());
    }
}
