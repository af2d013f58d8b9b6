//! pocketllm - on-device LLM session manager
//!
//! Loads quantized models on the best compute backend a device can actually
//! run, falls back through the remaining backends down to CPU when a load
//! fails, and drives token-by-token generation and sentence embeddings.
//!
//! # Core Concepts
//!
//! - **Hardware probe**: classifies the GPU vendor from platform identifiers
//!   and checks the device against a denylist of known-bad accelerators
//! - **Backend selection**: ordered candidates, each marked tried after a
//!   failed load, with crash recovery through a persisted history file
//! - **Session**: one chat model and one embedding model, each owning its
//!   context, released context-first
//! - **Engine**: prompt formatting, chunked prefill, sampling, stop sequences
//!   and cooperative cancellation
//!
//! # Example Usage
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use pocketllm::{CandleLoader, EngineConfig, LlmEngine, Session};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), pocketllm::EngineError> {
//! let session = Session::new(Arc::new(CandleLoader::new()), EngineConfig::default())?;
//! let engine = LlmEngine::new(session);
//! engine.load_chat_model_tuned("/models/qwen2.5-0.5b-q4.gguf", None).await?;
//!
//! let mut stream = engine.completion_stream("Why is the sky blue?");
//! while let Some(piece) = stream.next().await {
//!     print!("{}", piece?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod prompt;
pub mod runtime;
pub mod session;
pub mod util;

pub use backend::{BackendSelector, ComputeBackend};
pub use config::{EngineConfig, SamplingParams};
pub use engine::{
    Completion, CompletionStream, FinishReason, LlmEngine, StopHandle, TokenSink,
};
pub use error::{EngineError, Result};
pub use hardware::{GpuVendor, HardwareProbe};
pub use runtime::candle::CandleLoader;
pub use runtime::mock::MockRuntime;
pub use session::{HardwareInfo, Session};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
