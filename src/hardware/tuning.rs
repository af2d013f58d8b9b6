//! Per-device context tuning

use super::probe::HardwareProfile;
use sysinfo::System;
use tracing::info;

/// SoCs whose accelerator drivers misbehave with large batches and mmap'd weights.
/// sm8450: Snapdragon 8 Gen 1, sm8550: Snapdragon 8 Gen 2, s5e9925: Exynos 2200.
const PROBLEMATIC_SOCS: &[&str] = &["sm8450", "sm8550", "s5e9925"];

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Context parameters recommended for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTuning {
    pub batch_size: u32,
    pub context_size: u32,
    pub use_mmap: bool,
}

impl DeviceTuning {
    /// Recommendation from a hardware profile and the total RAM in bytes
    pub fn recommend(profile: &HardwareProfile, total_ram_bytes: u64) -> Self {
        let chip = profile.chip_identifiers();
        let problematic = chip
            .iter()
            .any(|id| PROBLEMATIC_SOCS.iter().any(|soc| id.contains(soc)));
        let exynos = chip
            .iter()
            .any(|id| id.contains("exynos") || id.contains("samsung"));

        let batch_size = if problematic {
            32
        } else if exynos {
            256
        } else {
            512
        };

        // 2048 instead of 4096 saves ~300MB, which decides OOM on 8GB phones with 7B models
        let total_gb = total_ram_bytes as f64 / BYTES_PER_GB;
        let context_size = if total_gb > 8.5 { 4096 } else { 2048 };

        Self {
            batch_size,
            context_size,
            use_mmap: !problematic,
        }
    }

    /// Recommendation using the RAM reported by the OS
    pub fn detect(profile: &HardwareProfile) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let tuning = Self::recommend(profile, sys.total_memory());
        info!(
            batch = tuning.batch_size,
            ctx = tuning.context_size,
            mmap = tuning.use_mmap,
            "Device tuning: {:.1}GB RAM",
            sys.total_memory() as f64 / BYTES_PER_GB
        );
        tuning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn profile(soc: &str, hardware: &str) -> HardwareProfile {
        HardwareProfile::from_identifiers("dev", "model", soc, hardware)
    }

    #[test]
    fn test_problematic_soc_gets_small_batch_and_no_mmap() {
        let tuning = DeviceTuning::recommend(&profile("SM8450", "qcom"), 12 * GB);
        assert_eq!(tuning.batch_size, 32);
        assert!(!tuning.use_mmap);
        assert_eq!(tuning.context_size, 4096);
    }

    #[test]
    fn test_exynos_batch() {
        let tuning = DeviceTuning::recommend(&profile("", "exynos2100"), 8 * GB);
        assert_eq!(tuning.batch_size, 256);
        assert!(tuning.use_mmap);
        assert_eq!(tuning.context_size, 2048);
    }

    #[test]
    fn test_generic_device_defaults() {
        let tuning = DeviceTuning::recommend(&profile("", ""), 6 * GB);
        assert_eq!(
            tuning,
            DeviceTuning {
                batch_size: 512,
                context_size: 2048,
                use_mmap: true
            }
        );
    }

    #[test]
    fn test_detect_uses_host_ram() {
        let tuning = DeviceTuning::detect(&profile("", ""));
        assert!(tuning.context_size == 2048 || tuning.context_size == 4096);
    }
}
