//! Backend selection for the Burn framework.
//!
//! The default build trains on the NdArray (CPU) backend; the `cuda` feature
//! switches the training backend to CUDA. GPU probing is used to fail fast
//! when accelerated training is requested on a machine that cannot provide it.

use burn::backend::Autodiff;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device handle of the default backend
pub type DefaultDevice = <DefaultBackend as burn::tensor::backend::Backend>::Device;

/// Resolve the device for a worker's local device index.
#[cfg(not(feature = "cuda"))]
pub fn device_for(_local_index: usize) -> DefaultDevice {
    // NdArray exposes a single CPU device; workers share it.
    burn::backend::ndarray::NdArrayDevice::Cpu
}

/// Resolve the device for a worker's local device index.
#[cfg(feature = "cuda")]
pub fn device_for(local_index: usize) -> DefaultDevice {
    burn_cuda::CudaDevice::new(local_index)
}

/// Human-readable name for the compiled backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }
    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}

/// Whether this build can drive a GPU at all.
pub fn accelerated_build() -> bool {
    cfg!(feature = "cuda")
}

/// Check whether GPU-class compute is present on this machine.
pub fn is_gpu_available() -> bool {
    has_nvidia_gpu()
}

fn has_nvidia_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
            || std::process::Command::new("nvidia-smi")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("nvidia-smi.exe")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name() {
        assert!(!backend_name().is_empty());
    }

    #[test]
    fn test_gpu_probe_does_not_panic() {
        let _ = is_gpu_available();
    }

    #[test]
    fn test_device_for_is_usable() {
        let device = device_for(0);
        let t = burn::tensor::Tensor::<DefaultBackend, 1>::zeros([4], &device);
        assert_eq!(t.dims(), [4]);
    }
}
