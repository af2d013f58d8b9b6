//! Model and context lifecycle
//!
//! A [`Session`] owns at most one chat model/context pair and one embedding
//! model/context pair. The two slots are independent: loading or replacing one
//! never touches the other. A context is always released before its model, and
//! a failed load never leaves a half-initialised slot behind.

mod file_check;

pub use file_check::validate_model_file;

use crate::backend::{BackendHistory, BackendSelector, ComputeBackend, EMBEDDING_ORDER};
use crate::config::{ConfigError, EngineConfig};
use crate::engine::{self, Completion, GenerationOptions, StopHandle, TokenSink};
use crate::error::{EngineError, Result};
use crate::hardware::{self, BackendPolicy, DeviceTuning, GpuVendor, HardwareProbe};
use crate::prompt::PromptFormatter;
use crate::runtime::{ContextParams, InferenceContext, Model, ModelLoader};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Context window of embedding contexts. The batch spans the whole window.
pub const EMBEDDING_CONTEXT_SIZE: u32 = 2048;

/// Loaded model plus its context. Fields drop in order, so the context goes first.
struct ModelSlot {
    context: Box<dyn InferenceContext>,
    model: Box<dyn Model>,
    backend: ComputeBackend,
    path: PathBuf,
}

impl ModelSlot {
    fn release(self, slot: &str) {
        let ModelSlot {
            context,
            model,
            backend,
            path,
        } = self;
        drop(context);
        drop(model);
        info!(slot, backend = %backend, "Released model {}", path.display());
    }
}

/// Accelerator status for display by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareInfo {
    pub accelerator_active: bool,
    pub backend_name: String,
    pub gpu_vendor: GpuVendor,
    /// The OpenCL driver library can be loaded on this device
    pub secondary_library_present: bool,
}

/// On-device inference session
pub struct Session {
    loader: Arc<dyn ModelLoader>,
    selector: BackendSelector,
    config: EngineConfig,
    options: GenerationOptions,
    chat: Option<ModelSlot>,
    embedding: Option<ModelSlot>,
    chat_template: Option<String>,
    stop: StopHandle,
    active_backend: Option<ComputeBackend>,
}

impl Session {
    /// Session probing the running device, with policy and history from `config`
    pub fn new(loader: Arc<dyn ModelLoader>, config: EngineConfig) -> Result<Self> {
        let policy = BackendPolicy::load_or_default(config.backend_policy.as_deref());
        let history = BackendHistory::open_or_in_memory(config.history_path().as_deref());
        let selector = BackendSelector::new(HardwareProbe::system(), policy, history);
        Self::with_selector(loader, config, selector)
    }

    pub fn with_selector(
        loader: Arc<dyn ModelLoader>,
        config: EngineConfig,
        selector: BackendSelector,
    ) -> Result<Self> {
        config.validate()?;
        debug!("Session created with {} loader", loader.name());
        Ok(Self {
            loader,
            selector,
            options: GenerationOptions::from_config(&config),
            config,
            chat: None,
            embedding: None,
            chat_template: None,
            stop: StopHandle::new(),
            active_backend: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    /// Load the chat model at `path`, replacing any previous one.
    ///
    /// `template` replaces the stored custom chat template; `None` clears it.
    pub fn load_chat(
        &mut self,
        path: &Path,
        template: Option<&str>,
        batch_size: u32,
        context_size: u32,
        use_mmap: bool,
    ) -> Result<()> {
        if batch_size == 0 || context_size == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "batch size ({batch_size}) and context size ({context_size}) must be positive"
            ))
            .into());
        }
        validate_model_file(path, self.config.min_model_bytes)?;

        self.chat_template = template
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string);

        if let Some(previous) = self.chat.take() {
            previous.release("chat");
        }
        self.active_backend = None;

        let loaded = self
            .selector
            .select_and_load(self.loader.as_ref(), path, use_mmap)?;

        let params = ContextParams {
            n_ctx: context_size,
            n_batch: batch_size,
            embeddings: false,
        };
        let context = match loaded.model.new_context(&params) {
            Ok(ctx) => ctx,
            Err(e) => {
                drop(loaded.model);
                error!(backend = %loaded.backend, "Failed to create context: {}", e);
                return Err(EngineError::ContextCreationFailed(e.to_string()));
            }
        };

        info!(
            backend = %loaded.backend,
            ctx = context_size,
            batch = batch_size,
            custom_template = self.chat_template.is_some(),
            "Chat model loaded"
        );
        self.active_backend = Some(loaded.backend);
        self.chat = Some(ModelSlot {
            context,
            model: loaded.model,
            backend: loaded.backend,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// [`Session::load_chat`] with batch size, context size and mmap chosen for this device
    pub fn load_chat_tuned(&mut self, path: &Path, template: Option<&str>) -> Result<()> {
        let tuning = self.device_tuning();
        self.load_chat(
            path,
            template,
            tuning.batch_size,
            tuning.context_size,
            tuning.use_mmap,
        )
    }

    pub fn device_tuning(&self) -> DeviceTuning {
        DeviceTuning::detect(&self.selector.probe().classify())
    }

    /// Load the embedding model at `path`, replacing any previous one
    pub fn load_embedding(&mut self, path: &Path) -> Result<()> {
        validate_model_file(path, self.config.min_model_bytes)?;

        if let Some(previous) = self.embedding.take() {
            previous.release("embedding");
        }

        let loaded =
            self.selector
                .load_with_fixed_order(self.loader.as_ref(), path, &EMBEDDING_ORDER, true)?;

        let params = ContextParams {
            n_ctx: EMBEDDING_CONTEXT_SIZE,
            n_batch: EMBEDDING_CONTEXT_SIZE,
            embeddings: true,
        };
        let context = match loaded.model.new_context(&params) {
            Ok(ctx) => ctx,
            Err(e) => {
                drop(loaded.model);
                error!(backend = %loaded.backend, "Failed to create embedding context: {}", e);
                return Err(EngineError::ContextCreationFailed(e.to_string()));
            }
        };

        info!(backend = %loaded.backend, "Embedding model loaded");
        self.embedding = Some(ModelSlot {
            context,
            model: loaded.model,
            backend: loaded.backend,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Release both slots. Safe to call on an empty session.
    pub fn unload_all(&mut self) {
        if let Some(chat) = self.chat.take() {
            chat.release("chat");
        }
        if let Some(embedding) = self.embedding.take() {
            embedding.release("embedding");
        }
        self.active_backend = None;
    }

    pub fn has_chat_model(&self) -> bool {
        self.chat.is_some()
    }

    pub fn has_embedding_model(&self) -> bool {
        self.embedding.is_some()
    }

    /// Custom chat template stored by the last chat load
    pub fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    /// Backend the chat model runs on
    pub fn active_backend(&self) -> Option<ComputeBackend> {
        self.active_backend
    }

    pub fn is_accelerator_active(&self) -> bool {
        self.active_backend.is_some_and(|b| b.is_accelerator())
    }

    pub fn is_secondary_accelerator_library_present(&self) -> bool {
        hardware::is_opencl_library_present()
    }

    pub fn hardware_info(&self) -> HardwareInfo {
        let profile = self.selector.probe().classify();
        HardwareInfo {
            accelerator_active: self.is_accelerator_active(),
            backend_name: self
                .active_backend
                .map(|b| b.to_string())
                .unwrap_or_else(|| "none".to_string()),
            gpu_vendor: profile.vendor,
            secondary_library_present: self.is_secondary_accelerator_library_present(),
        }
    }

    /// Forget recorded backend failures so accelerators are attempted again
    pub fn clear_backend_failures(&mut self) {
        self.selector.history_mut().clear_failures();
    }

    /// Ask the running generation to stop at the next token boundary
    pub fn stop_generation(&self) {
        self.stop.request();
    }

    /// Handle for stopping generations from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Format `user_prompt` with the system prompt and stream the reply into `sink`
    pub fn generate(&mut self, user_prompt: &str, sink: &mut dyn TokenSink) -> Result<Completion> {
        let slot = self.chat.as_mut().ok_or(EngineError::ModelNotLoaded)?;

        let prompt = PromptFormatter::new(slot.model.as_ref(), self.chat_template.as_deref())
            .format(&self.config.system_prompt, user_prompt);
        debug!("Formatted prompt: {}", prompt);

        engine::generate(
            slot.model.as_ref(),
            slot.context.as_mut(),
            &prompt,
            &self.options,
            &self.stop,
            sink,
        )
    }

    /// Embed `text` with the embedding model, or the chat model when none is loaded.
    ///
    /// `None` when no model is loaded at all.
    pub fn embed(&mut self, text: &str) -> Result<Option<Vec<f32>>> {
        let slot = match self.embedding.as_mut().or(self.chat.as_mut()) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        engine::embed(slot.model.as_ref(), slot.context.as_mut(), text).map(Some)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unload_all();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("loader", &self.loader.name())
            .field("chat", &self.chat.as_ref().map(|s| &s.path))
            .field("embedding", &self.embedding.as_ref().map(|s| &s.path))
            .field("active_backend", &self.active_backend)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::StaticProperties;
    use crate::runtime::mock::MockRuntime;
    use tempfile::TempDir;

    fn session(runtime: &MockRuntime) -> Session {
        let selector = BackendSelector::new(
            HardwareProbe::new(Arc::new(StaticProperties::new())),
            BackendPolicy::default(),
            BackendHistory::in_memory(),
        );
        let config = EngineConfig {
            min_model_bytes: 16,
            ..EngineConfig::builtin()
        };
        Session::with_selector(Arc::new(runtime.clone()), config, selector).unwrap()
    }

    fn model_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        path
    }

    #[test]
    fn test_generate_without_model() {
        let runtime = MockRuntime::new();
        let mut s = session(&runtime);
        let mut sink = |_: &str| {};
        assert!(matches!(
            s.generate("hi", &mut sink),
            Err(EngineError::ModelNotLoaded)
        ));
    }

    #[test]
    fn test_zero_batch_rejected_before_touching_slots() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let mut s = session(&runtime);
        let err = s.load_chat(&model_file(&dir), None, 0, 2048, true).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(runtime.attempts().is_empty());
    }

    #[test]
    fn test_blank_template_clears_stored_template() {
        let dir = TempDir::new().unwrap();
        let path = model_file(&dir);
        let runtime = MockRuntime::new();
        let mut s = session(&runtime);

        s.load_chat(&path, Some("llama3"), 512, 2048, true).unwrap();
        assert_eq!(s.chat_template(), Some("llama3"));
        s.load_chat(&path, Some(" "), 512, 2048, true).unwrap();
        assert_eq!(s.chat_template(), None);
    }

    #[test]
    fn test_hardware_info_before_and_after_load() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        let mut s = session(&runtime);
        assert_eq!(s.hardware_info().backend_name, "none");

        s.load_chat(&model_file(&dir), None, 512, 2048, true).unwrap();
        let info = s.hardware_info();
        assert!(info.accelerator_active);
        assert_eq!(info.backend_name, "OpenCL");
        assert_eq!(info.gpu_vendor, GpuVendor::Unknown);
    }

    #[test]
    fn test_drop_releases_everything() {
        let dir = TempDir::new().unwrap();
        let runtime = MockRuntime::new();
        {
            let mut s = session(&runtime);
            s.load_chat(&model_file(&dir), None, 512, 2048, true).unwrap();
            s.load_embedding(&model_file(&dir)).unwrap();
            assert_eq!(runtime.live_models(), 2);
        }
        assert_eq!(runtime.live_models(), 0);
        assert_eq!(runtime.live_contexts(), 0);
        assert_eq!(runtime.drop_order_violations(), 0);
    }
}
