//! Shared helpers for integration tests

use pocketllm::backend::{BackendHistory, BackendSelector};
use pocketllm::hardware::properties::{
    PROP_BOARD_PLATFORM, PROP_HARDWARE, PROP_PRODUCT_DEVICE, PROP_PRODUCT_MODEL,
};
use pocketllm::hardware::{BackendPolicy, HardwareProbe, StaticProperties};
use pocketllm::{EngineConfig, MockRuntime, Session, StopHandle};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

/// Minimum model size used by test sessions
pub const TEST_MIN_MODEL_BYTES: u64 = 64;

/// Write a file large enough to pass the model size check
#[allow(dead_code)]
pub fn model_file(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, vec![0u8; 4 * TEST_MIN_MODEL_BYTES as usize]).unwrap();
    path
}

#[allow(dead_code)]
pub fn test_config() -> EngineConfig {
    EngineConfig {
        min_model_bytes: TEST_MIN_MODEL_BYTES,
        ..EngineConfig::builtin()
    }
}

/// Device with no identifying properties (unknown vendor)
#[allow(dead_code)]
pub fn unknown_device() -> StaticProperties {
    StaticProperties::new()
}

#[allow(dead_code)]
pub fn adreno_device() -> StaticProperties {
    StaticProperties::new()
        .with(PROP_PRODUCT_MODEL, "SM-S918B")
        .with(PROP_PRODUCT_DEVICE, "dm3q")
        .with(PROP_BOARD_PLATFORM, "kalama")
        .with(PROP_HARDWARE, "qcom")
}

/// Galaxy S22 with Exynos 2200, denylisted for accelerators
#[allow(dead_code)]
pub fn denylisted_device() -> StaticProperties {
    StaticProperties::new()
        .with(PROP_PRODUCT_MODEL, "SM-S901B")
        .with(PROP_PRODUCT_DEVICE, "r0s")
        .with(PROP_BOARD_PLATFORM, "s5e9925")
        .with(PROP_HARDWARE, "s5e9925")
}

#[allow(dead_code)]
pub fn session_with(runtime: &MockRuntime, device: StaticProperties, history: BackendHistory) -> Session {
    let selector = BackendSelector::new(
        HardwareProbe::new(Arc::new(device)),
        BackendPolicy::default(),
        history,
    );
    Session::with_selector(Arc::new(runtime.clone()), test_config(), selector).unwrap()
}

#[allow(dead_code)]
pub fn session(runtime: &MockRuntime) -> Session {
    session_with(runtime, unknown_device(), BackendHistory::in_memory())
}

/// Session with a chat model already loaded
#[allow(dead_code)]
pub fn chat_session(runtime: &MockRuntime, dir: &TempDir) -> Session {
    let mut s = session(runtime);
    s.load_chat(&model_file(dir, "chat.gguf"), None, 512, 2048, true)
        .unwrap();
    s
}

/// Slot for a stop handle that only exists once the session is built.
///
/// Decode hooks are installed on the runtime before the session, so they
/// reach the session's handle through this cell.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct LateStop(Arc<OnceLock<StopHandle>>);

#[allow(dead_code)]
impl LateStop {
    pub fn bind(&self, handle: StopHandle) {
        let _ = self.0.set(handle);
    }

    pub fn request(&self) {
        if let Some(handle) = self.0.get() {
            handle.request();
        }
    }
}

#[allow(dead_code)]
pub fn history_file(dir: &Path) -> PathBuf {
    dir.join(pocketllm::backend::HISTORY_FILE)
}
