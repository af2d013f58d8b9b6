//! Platform property readers
//!
//! Android exposes SoC and device identifiers as system properties. The probe
//! reads them through [`PlatformProperties`] so tests and non-Android hosts can
//! substitute a fixed table.

use std::collections::HashMap;
use std::process::Command;
use tracing::debug;

pub const PROP_SOC_MANUFACTURER: &str = "ro.soc.manufacturer";
pub const PROP_SOC_MODEL: &str = "ro.soc.model";
pub const PROP_HARDWARE: &str = "ro.hardware";
pub const PROP_BOARD_PLATFORM: &str = "ro.board.platform";
pub const PROP_EGL_DRIVER: &str = "ro.hardware.egl";
pub const PROP_PRODUCT_MODEL: &str = "ro.product.model";
pub const PROP_PRODUCT_DEVICE: &str = "ro.product.device";

/// Read-only access to opaque platform identifiers
pub trait PlatformProperties: Send + Sync {
    /// Value of `key`, `None` when unset or empty
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads Android system properties through `getprop`
///
/// On hosts without `getprop` every lookup yields `None`, which classifies as
/// an unknown vendor.
#[derive(Debug, Clone, Default)]
pub struct SystemProperties;

impl PlatformProperties for SystemProperties {
    fn get(&self, key: &str) -> Option<String> {
        match Command::new("getprop").arg(key).output() {
            Ok(out) if out.status.success() => {
                let value = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            }
            Ok(_) => None,
            Err(e) => {
                debug!("getprop unavailable for {}: {}", key, e);
                None
            }
        }
    }
}

/// Fixed property table
#[derive(Debug, Clone, Default)]
pub struct StaticProperties {
    values: HashMap<String, String>,
}

impl StaticProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl PlatformProperties for StaticProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).filter(|v| !v.is_empty()).cloned()
    }
}
