//! GPU vendor classification from platform identifiers

use super::properties::{
    PlatformProperties, PROP_BOARD_PLATFORM, PROP_EGL_DRIVER, PROP_HARDWARE, PROP_PRODUCT_DEVICE,
    PROP_PRODUCT_MODEL, PROP_SOC_MANUFACTURER, PROP_SOC_MODEL,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// GPU vendor family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    /// Qualcomm Adreno
    Adreno,
    /// ARM Mali and the other non-Qualcomm mobile families (Exynos, MediaTek, Tensor)
    Mali,
    Unknown,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Adreno => write!(f, "Adreno"),
            GpuVendor::Mali => write!(f, "Mali"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

const ADRENO_MARKERS: &[&str] = &[
    "adreno", "qcom", "qualcomm", "snapdragon", "sm8", "sm7", "sm6", "sdm", "msm", "kona",
    "lahaina", "taro", "kalama", "pineapple",
];

const MALI_MARKERS: &[&str] = &[
    "mali", "exynos", "s5e", "universal", "mediatek", "mt6", "mt8", "gs101", "gs201", "zuma",
    "tensor",
];

/// Hardware identity for one load attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareProfile {
    pub vendor: GpuVendor,
    /// `ro.product.device`, e.g. `r0s`
    pub device_id: String,
    /// `ro.product.model`, e.g. `SM-S901B`
    pub model_id: String,
    /// SoC model, falling back to the board platform
    pub soc_id: String,
    /// `ro.hardware`
    pub hardware: String,
}

impl HardwareProfile {
    /// Build a profile from raw identifiers, classifying the vendor
    pub fn from_identifiers(
        device_id: impl Into<String>,
        model_id: impl Into<String>,
        soc_id: impl Into<String>,
        hardware: impl Into<String>,
    ) -> Self {
        let device_id = device_id.into();
        let model_id = model_id.into();
        let soc_id = soc_id.into();
        let hardware = hardware.into();
        let vendor = classify_vendor(&[soc_id.as_str(), hardware.as_str()]);
        Self {
            vendor,
            device_id,
            model_id,
            soc_id,
            hardware,
        }
    }

    /// Lowercased identifiers that describe the chip rather than the product
    pub fn chip_identifiers(&self) -> [String; 2] {
        [self.soc_id.to_lowercase(), self.hardware.to_lowercase()]
    }
}

/// Classify identifiers by known substrings. Anything unmatched is `Unknown`.
pub fn classify_vendor(identifiers: &[&str]) -> GpuVendor {
    let haystack: Vec<String> = identifiers
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect();

    let matches = |markers: &[&str]| {
        haystack
            .iter()
            .any(|id| markers.iter().any(|m| id.contains(m)))
    };

    if matches(ADRENO_MARKERS) {
        GpuVendor::Adreno
    } else if matches(MALI_MARKERS) {
        GpuVendor::Mali
    } else {
        GpuVendor::Unknown
    }
}

/// Reads platform identifiers and classifies the GPU vendor
#[derive(Clone)]
pub struct HardwareProbe {
    properties: Arc<dyn PlatformProperties>,
}

impl HardwareProbe {
    pub fn new(properties: Arc<dyn PlatformProperties>) -> Self {
        Self { properties }
    }

    /// Probe the running device through `getprop`
    pub fn system() -> Self {
        Self::new(Arc::new(super::properties::SystemProperties))
    }

    pub fn classify(&self) -> HardwareProfile {
        let prop = |key: &str| self.properties.get(key).unwrap_or_default();

        let egl = prop(PROP_EGL_DRIVER);
        let soc_manufacturer = prop(PROP_SOC_MANUFACTURER);
        let soc_model = prop(PROP_SOC_MODEL);
        let board = prop(PROP_BOARD_PLATFORM);
        let hardware = prop(PROP_HARDWARE);

        let soc_id = if !soc_model.is_empty() {
            soc_model.clone()
        } else if !board.is_empty() {
            board.clone()
        } else {
            hardware.clone()
        };

        let vendor = classify_vendor(&[
            egl.as_str(),
            soc_manufacturer.as_str(),
            soc_model.as_str(),
            board.as_str(),
            hardware.as_str(),
        ]);

        let profile = HardwareProfile {
            vendor,
            device_id: prop(PROP_PRODUCT_DEVICE),
            model_id: prop(PROP_PRODUCT_MODEL),
            soc_id,
            hardware,
        };

        info!(
            vendor = %profile.vendor,
            model = %profile.model_id,
            device = %profile.device_id,
            soc = %profile.soc_id,
            "Hardware classified"
        );
        debug!("Hardware profile: {:?}", profile);

        profile
    }
}

impl fmt::Debug for HardwareProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareProbe").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::properties::StaticProperties;
    use yare::parameterized;

    #[parameterized(
        snapdragon_soc = { &["SM8450", ""], GpuVendor::Adreno },
        qcom_hardware = { &["", "qcom"], GpuVendor::Adreno },
        egl_adreno = { &["adreno"], GpuVendor::Adreno },
        exynos = { &["exynos2100"], GpuVendor::Mali },
        mediatek = { &["MT6983"], GpuVendor::Mali },
        tensor = { &["gs201"], GpuVendor::Mali },
        emulator = { &["ranchu", "goldfish"], GpuVendor::Unknown },
        empty = { &["", ""], GpuVendor::Unknown },
    )]
    fn test_classify_vendor(ids: &[&str], expected: GpuVendor) {
        assert_eq!(classify_vendor(ids), expected);
    }

    #[test]
    fn test_classify_reads_properties() {
        let props = StaticProperties::new()
            .with(PROP_PRODUCT_MODEL, "SM-S901B")
            .with(PROP_PRODUCT_DEVICE, "r0s")
            .with(PROP_BOARD_PLATFORM, "s5e9925")
            .with(PROP_HARDWARE, "s5e9925");
        let profile = HardwareProbe::new(Arc::new(props)).classify();

        assert_eq!(profile.vendor, GpuVendor::Mali);
        assert_eq!(profile.model_id, "SM-S901B");
        assert_eq!(profile.device_id, "r0s");
        assert_eq!(profile.soc_id, "s5e9925");
    }

    #[test]
    fn test_soc_model_preferred_over_board() {
        let props = StaticProperties::new()
            .with(PROP_SOC_MODEL, "SM8550")
            .with(PROP_BOARD_PLATFORM, "kalama");
        let profile = HardwareProbe::new(Arc::new(props)).classify();
        assert_eq!(profile.soc_id, "SM8550");
        assert_eq!(profile.vendor, GpuVendor::Adreno);
    }

    #[test]
    fn test_unmatched_is_unknown_not_error() {
        let profile = HardwareProbe::new(Arc::new(StaticProperties::new())).classify();
        assert_eq!(profile.vendor, GpuVendor::Unknown);
        assert!(profile.model_id.is_empty());
    }
}
