//! Inference runtime abstraction layer
//!
//! The session manager never touches tensors. Everything it needs from the
//! underlying inference library (weights loading, tokenization, decode, logits,
//! chat templates) goes through the object-safe traits in this module, so the
//! candle runtime, the scripted mock and any future binding are interchangeable.

mod batch;
pub mod candle;
pub mod mock;
pub mod template;

pub use batch::{BatchEntry, BatchFull, TokenBatch};

use crate::backend::ComputeBackend;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Vocabulary token identifier
pub type TokenId = u32;

/// Errors reported by an inference runtime
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("{backend} backend is not available: {reason}")]
    BackendUnavailable {
        backend: ComputeBackend,
        reason: String,
    },

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Failed to create context: {0}")]
    Context(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("{0}")]
    Other(String),
}

/// Enable switches for the two accelerator paths during one load attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceleratorToggles {
    pub primary_enabled: bool,
    pub secondary_enabled: bool,
}

impl AcceleratorToggles {
    /// Toggles that enable exactly the accelerator `backend` targets
    pub fn for_backend(backend: ComputeBackend) -> Self {
        Self {
            primary_enabled: backend == ComputeBackend::Vulkan,
            secondary_enabled: backend == ComputeBackend::OpenCl,
        }
    }

    pub fn allows(&self, backend: ComputeBackend) -> bool {
        match backend {
            ComputeBackend::Cpu => true,
            ComputeBackend::Vulkan => self.primary_enabled,
            ComputeBackend::OpenCl => self.secondary_enabled,
        }
    }
}

/// Parameters for one model load attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelParams {
    pub backend: ComputeBackend,
    /// Number of layers to offload: `-1` offloads all, `0` keeps everything on CPU
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub accelerators: AcceleratorToggles,
}

impl ModelParams {
    pub fn for_backend(backend: ComputeBackend, use_mmap: bool) -> Self {
        Self {
            backend,
            n_gpu_layers: if backend.is_accelerator() { -1 } else { 0 },
            use_mmap,
            accelerators: AcceleratorToggles::for_backend(backend),
        }
    }
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::for_backend(ComputeBackend::Cpu, true)
    }
}

/// Parameters for creating a compute context on a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window in tokens
    pub n_ctx: u32,
    /// Maximum tokens per decode call
    pub n_batch: u32,
    /// Produce embeddings instead of next-token logits
    pub embeddings: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            embeddings: false,
        }
    }
}

/// One message of a chat transcript handed to a chat template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Loads model weights for a specific backend
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Box<dyn Model>, RuntimeError>;
}

/// Model weights plus vocabulary
pub trait Model: Send {
    /// Create a compute context bound to this model.
    ///
    /// The returned context must be dropped before the model.
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>, RuntimeError>;

    /// Tokenize `text` into `out`.
    ///
    /// Returns the number of tokens written, or the negated required size when
    /// `out` is too small.
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool, out: &mut [TokenId]) -> i32;

    fn token_to_piece(&self, token: TokenId) -> Result<String, RuntimeError>;

    /// True for end-of-generation tokens (EOS, end-of-turn)
    fn is_eog(&self, token: TokenId) -> bool;

    /// Chat template embedded in the model file, if any
    fn chat_template(&self) -> Option<String>;

    /// Render `messages` with `template` into `buf`.
    ///
    /// Returns the full byte length of the rendered prompt (which may exceed
    /// `buf.len()`, in which case only a prefix was written), or a value
    /// `<= 0` when the template is not usable.
    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32;

    /// Context length the model was trained with
    fn n_ctx_train(&self) -> u32;
}

/// Compute context holding the sequence memory (KV cache)
pub trait InferenceContext: Send {
    fn n_ctx(&self) -> u32;

    fn n_batch(&self) -> u32;

    /// Drop every sequence from memory
    fn clear_memory(&mut self);

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError>;

    /// Logits for the `i`-th logits-requesting entry of the last batch, `-1` for the last one
    fn logits_ith(&self, i: i32) -> Option<&[f32]>;

    /// Pooled embedding for a sequence, when the runtime supports pooling
    fn embeddings_seq(&self, seq_id: i32) -> Option<&[f32]>;

    /// Raw embedding buffer of the last decoded batch
    fn embeddings_raw(&self) -> Option<&[f32]>;
}

impl fmt::Debug for dyn Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("n_ctx_train", &self.n_ctx_train())
            .finish()
    }
}

impl fmt::Debug for dyn InferenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceContext")
            .field("n_ctx", &self.n_ctx())
            .field("n_batch", &self.n_batch())
            .finish()
    }
}
