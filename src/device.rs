//! # Compute Device Selection
//!
//! Picks where the recognizer runs. GPU backends fall back to the CPU when the
//! driver or the feature is missing, so a misconfigured host still recognizes
//! speech, just slower.

use crate::error::BotError;
use candle_core::Device;
use std::sync::OnceLock;

/// Detected once per process; probing CUDA repeatedly is slow.
static DETECTED: OnceLock<Device> = OnceLock::new();

/// `recognizer.device` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Best available: CUDA, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            other => Err(BotError::Config(format!("Unknown device '{}'", other))),
        }
    }
}

/// Resolve a preference to a concrete device.
pub fn resolve(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Auto => DETECTED.get_or_init(detect).clone(),
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda().unwrap_or_else(|| {
            tracing::warn!("CUDA requested but unavailable, using CPU");
            Device::Cpu
        }),
        DevicePreference::Metal => metal().unwrap_or_else(|| {
            tracing::warn!("Metal requested but unavailable, using CPU");
            Device::Cpu
        }),
    }
}

/// Short name for logs.
pub fn label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

fn detect() -> Device {
    let device = cuda().or_else(metal).unwrap_or(Device::Cpu);
    tracing::info!("Recognizer device: {}", label(&device));
    device
}

fn cuda() -> Option<Device> {
    Device::new_cuda(0)
        .map_err(|e| tracing::debug!("CUDA not available: {}", e))
        .ok()
}

fn metal() -> Option<Device> {
    Device::new_metal(0)
        .map_err(|e| tracing::debug!("Metal not available: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!(" CPU ".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!(matches!("tpu".parse::<DevicePreference>(), Err(BotError::Config(_))));
    }

    #[test]
    fn test_cpu_always_resolves() {
        assert_eq!(label(&resolve(DevicePreference::Cpu)), "cpu");
    }
}
