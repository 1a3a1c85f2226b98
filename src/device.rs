//! Accelerator and precision selection

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Requested compute device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// Metal on Apple silicon, then CUDA, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Requested weight precision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DTypeChoice {
    /// f16 on accelerators, f32 on CPU
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

fn is_apple_silicon() -> bool {
    cfg!(all(target_os = "macos", target_arch = "aarch64"))
}

/// Pick the device to train on and report the choice
pub fn select_device(choice: DeviceChoice) -> Result<Device> {
    let device = match choice {
        DeviceChoice::Cpu => Device::Cpu,
        DeviceChoice::Cuda => Device::new_cuda(0).context("CUDA device requested but unavailable")?,
        DeviceChoice::Metal => Device::new_metal(0).context("Metal device requested but unavailable")?,
        DeviceChoice::Auto => {
            if is_apple_silicon() && candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else {
                Device::Cpu
            }
        }
    };

    match &device {
        Device::Metal(_) => println!("Using Apple Silicon Metal (GPU)"),
        Device::Cuda(_) => println!("Using CUDA GPU"),
        Device::Cpu => println!("Using CPU"),
    }
    tracing::info!(device = ?device, "Selected compute device");

    Ok(device)
}

/// Resolve the weight precision for a device
pub fn resolve_dtype(choice: DTypeChoice, device: &Device) -> DType {
    match choice {
        DTypeChoice::F32 => DType::F32,
        DTypeChoice::F16 => DType::F16,
        DTypeChoice::Bf16 => DType::BF16,
        DTypeChoice::Auto => {
            if device.is_cpu() {
                DType::F32
            } else {
                DType::F16
            }
        }
    }
}

/// Short hardware label recorded with the run
pub fn hardware_label(device: &Device) -> &'static str {
    match device {
        Device::Metal(_) => "Apple Silicon",
        Device::Cuda(_) => "CUDA",
        Device::Cpu => "CPU",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_selection() {
        let device = select_device(DeviceChoice::Cpu).unwrap();
        assert!(device.is_cpu());
        assert_eq!(hardware_label(&device), "CPU");
    }

    #[test]
    fn test_auto_dtype_on_cpu_is_f32() {
        assert_eq!(resolve_dtype(DTypeChoice::Auto, &Device::Cpu), DType::F32);
        assert_eq!(resolve_dtype(DTypeChoice::F16, &Device::Cpu), DType::F16);
    }
}
