//! # Device and Precision Selection
//!
//! Picks the compute device (CPU/GPU) and weight precision for the speech model
//! from the `models.device` and `models.compute_type` settings, falling back to
//! something that works when the request cannot be honoured.

use candle_core::{DType, Device};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached best available device to avoid repeated detection
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU, falling back to CPU if unavailable
    Cuda,
    /// Metal GPU, falling back to CPU if unavailable
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Weight precision for the loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputePrecision {
    F32,
    F16,
    Bf16,
}

impl ComputePrecision {
    /// Parse a `compute_type` setting. Unknown values (including quantized
    /// types such as `int8`) run at full precision.
    pub fn from_setting(setting: &str) -> Self {
        match setting.trim().to_lowercase().as_str() {
            "f32" | "float32" => ComputePrecision::F32,
            "f16" | "float16" => ComputePrecision::F16,
            "bf16" | "bfloat16" => ComputePrecision::Bf16,
            other => {
                warn!("Compute type '{}' is not supported, using f32", other);
                ComputePrecision::F32
            }
        }
    }

    /// Resolve to a tensor dtype for `device`. Half precision is only used on GPUs.
    pub fn dtype_for(&self, device: &Device) -> DType {
        match (self, device) {
            (ComputePrecision::F32, _) => DType::F32,
            (_, Device::Cpu) => {
                warn!("Half precision requested on CPU, using f32");
                DType::F32
            }
            (ComputePrecision::F16, _) => DType::F16,
            (ComputePrecision::Bf16, _) => DType::BF16,
        }
    }
}

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::get_cuda_device().unwrap_or(Device::Cpu),
            DevicePreference::Metal => Self::get_metal_device().unwrap_or(Device::Cpu),
        }
    }

    /// Get the best available device (cached)
    pub fn get_best_device() -> Device {
        BEST_DEVICE.get_or_init(Self::detect_best_device).clone()
    }

    fn detect_best_device() -> Device {
        info!("Detecting best available compute device...");

        if let Some(cuda_device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU for inference");
            return cuda_device;
        }

        if let Some(metal_device) = Self::get_metal_device() {
            info!("Selected Metal GPU for inference");
            return metal_device;
        }

        info!("Using CPU for inference (no GPU acceleration available)");
        Device::Cpu
    }

    fn get_cuda_device() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => {
                debug!("CUDA device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn get_metal_device() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => {
                debug!("Metal device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "CPU",
            Device::Cuda(_) => "CUDA GPU",
            Device::Metal(_) => "Metal GPU",
        }
    }
}

/// Create a device from a `models.device` setting, defaulting to auto-detection
/// for unrecognized values.
pub fn create_device_from_string(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => DeviceManager::get_device(preference),
        Err(_) => {
            warn!("Invalid device preference '{}', using auto", device_str);
            DeviceManager::get_best_device()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_precision_fallbacks() {
        assert_eq!(ComputePrecision::from_setting("int8"), ComputePrecision::F32);
        assert_eq!(ComputePrecision::from_setting("BF16"), ComputePrecision::Bf16);
        assert_eq!(ComputePrecision::F16.dtype_for(&Device::Cpu), DType::F32);
        assert_eq!(ComputePrecision::F32.dtype_for(&Device::Cpu), DType::F32);
    }

    #[test]
    fn test_cpu_always_available() {
        let device = create_device_from_string("cpu");
        assert_eq!(DeviceManager::describe(&device), "CPU");
    }
}
