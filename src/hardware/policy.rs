//! Backend preference policy
//!
//! Which accelerator a vendor family should try first, and which devices must
//! never touch an accelerator at all. The defaults encode what has been
//! observed on real hardware and can be replaced wholesale from a JSON file
//! (`POCKETLLM_BACKEND_POLICY`) once validated against a device fleet.

use super::probe::{GpuVendor, HardwareProfile};
use crate::backend::{BackendPlan, CandidateList, ComputeBackend, PlanReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read backend policy {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse backend policy {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid backend policy: {0}")]
    Invalid(String),
}

/// A (model, device) pair known to crash or corrupt output on any accelerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Case-insensitive substring of `ro.product.model`
    pub model: String,
    /// Case-insensitive substring of the device, SoC or hardware identifier
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl DeviceRule {
    pub fn new(model: impl Into<String>, device: Option<&str>) -> Self {
        Self {
            model: model.into(),
            device: device.map(str::to_string),
            note: None,
        }
    }

    pub fn matches(&self, profile: &HardwareProfile) -> bool {
        let model = self.model.to_lowercase();
        if model.is_empty() || !profile.model_id.to_lowercase().contains(&model) {
            return false;
        }
        match &self.device {
            None => true,
            Some(device) => {
                let device = device.to_lowercase();
                profile.device_id.to_lowercase().contains(&device)
                    || profile
                        .chip_identifiers()
                        .iter()
                        .any(|id| id.contains(&device))
            }
        }
    }
}

/// Vendor preference table plus device denylist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPolicy {
    /// First backend to attempt per vendor family
    #[serde(default)]
    pub vendor_preferences: BTreeMap<GpuVendor, ComputeBackend>,
    /// First backend for vendors missing from the table
    pub default_preference: ComputeBackend,
    /// Fixed priority walked after the preferred candidate fails
    pub fallback_order: Vec<ComputeBackend>,
    /// Devices forced to CPU
    #[serde(default)]
    pub denylist: Vec<DeviceRule>,
}

impl Default for BackendPolicy {
    fn default() -> Self {
        // Both known families are more stable on the OpenCL path. Unknown vendors
        // follow the same choice; this needs validation on real devices.
        let vendor_preferences = BTreeMap::from([
            (GpuVendor::Adreno, ComputeBackend::OpenCl),
            (GpuVendor::Mali, ComputeBackend::OpenCl),
        ]);

        // Exynos 2200 (Xclipse) S22 family: both accelerator paths crash the driver
        let denylist = vec![
            DeviceRule {
                model: "SM-S901B".to_string(),
                device: Some("s5e9925".to_string()),
                note: Some("Galaxy S22 (Exynos 2200)".to_string()),
            },
            DeviceRule {
                model: "SM-S906B".to_string(),
                device: Some("s5e9925".to_string()),
                note: Some("Galaxy S22+ (Exynos 2200)".to_string()),
            },
            DeviceRule {
                model: "SM-S908B".to_string(),
                device: Some("s5e9925".to_string()),
                note: Some("Galaxy S22 Ultra (Exynos 2200)".to_string()),
            },
        ];

        Self {
            vendor_preferences,
            default_preference: ComputeBackend::OpenCl,
            fallback_order: vec![
                ComputeBackend::OpenCl,
                ComputeBackend::Vulkan,
                ComputeBackend::Cpu,
            ],
            denylist,
        }
    }
}

impl BackendPolicy {
    /// Load a policy from a JSON file
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let shown = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: shown.clone(),
            source,
        })?;
        let policy: BackendPolicy =
            serde_json::from_str(&raw).map_err(|source| PolicyError::Parse {
                path: shown.clone(),
                source,
            })?;
        policy.validate()?;
        info!("Loaded backend policy from {}", shown);
        Ok(policy)
    }

    /// Load from `path` when given, falling back to the built-in table on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::load(p).unwrap_or_else(|e| {
                warn!("{}. Using built-in backend policy", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.fallback_order.is_empty() {
            return Err(PolicyError::Invalid(
                "fallback_order must not be empty".to_string(),
            ));
        }
        if self.denylist.iter().any(|r| r.model.trim().is_empty()) {
            return Err(PolicyError::Invalid(
                "denylist rules need a non-empty model".to_string(),
            ));
        }
        Ok(())
    }

    /// First denylist rule matching `profile`
    pub fn denylisted(&self, profile: &HardwareProfile) -> Option<&DeviceRule> {
        self.denylist.iter().find(|rule| rule.matches(profile))
    }

    pub fn preferred_for(&self, vendor: GpuVendor) -> ComputeBackend {
        self.vendor_preferences
            .get(&vendor)
            .copied()
            .unwrap_or(self.default_preference)
    }

    /// Ordered candidates for `profile`. The denylist overrides every heuristic.
    pub fn plan(&self, profile: &HardwareProfile) -> BackendPlan {
        if let Some(rule) = self.denylisted(profile) {
            info!(
                model = %profile.model_id,
                device = %profile.device_id,
                "Device is denylisted for accelerators, forcing CPU"
            );
            return BackendPlan {
                order: vec![ComputeBackend::Cpu],
                candidates: CandidateList::new([ComputeBackend::Cpu]),
                reason: PlanReason::Denylisted(rule.clone()),
            };
        }

        let preferred = self.preferred_for(profile.vendor);
        let mut order = vec![preferred];
        order.extend(self.fallback_order.iter().copied());
        // CPU always terminates the walk
        if !order.contains(&ComputeBackend::Cpu) {
            order.push(ComputeBackend::Cpu);
        }

        debug!(vendor = %profile.vendor, preferred = %preferred, "Backend plan computed");

        BackendPlan {
            candidates: CandidateList::new(order.iter().copied()),
            order,
            reason: PlanReason::VendorPreference(profile.vendor),
        }
    }
}
