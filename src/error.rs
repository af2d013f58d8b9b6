//! Error types for the session manager
//!
//! Only load failures that survive every fallback and decode failures are ever
//! surfaced to the host. Tokenizer buffer overflows and unusable chat templates
//! are recovered internally and have no variant here.

use crate::config::ConfigError;
use crate::runtime::RuntimeError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which part of a generation a decode failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    /// Prompt ingestion. Fatal to the request.
    Prefill,
}

impl fmt::Display for DecodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeStage::Prefill => write!(f, "prompt processing"),
        }
    }
}

/// Errors surfaced by [`crate::Session`] and [`crate::LlmEngine`]
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Model file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error(
        "Model file {} is too small ({size} bytes, minimum {minimum}), definitely corrupt",
        .path.display()
    )]
    FileImplausiblySmall {
        path: PathBuf,
        size: u64,
        minimum: u64,
    },

    /// Every backend candidate failed to load the model
    #[error("Failed to load model {} with all available backends (tried: {})", .path.display(), format_attempts(.attempted))]
    ModelLoadExhausted {
        path: PathBuf,
        attempted: Vec<crate::backend::ComputeBackend>,
    },

    #[error("Failed to create context: {0}")]
    ContextCreationFailed(String),

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed during {stage}: {message}")]
    Decode { stage: DecodeStage, message: String },

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn prefill(message: impl Into<String>) -> Self {
        EngineError::Decode {
            stage: DecodeStage::Prefill,
            message: message.into(),
        }
    }
}

fn format_attempts(attempted: &[crate::backend::ComputeBackend]) -> String {
    if attempted.is_empty() {
        return "none".to_string();
    }
    attempted
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
