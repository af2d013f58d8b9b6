//! Configuration management for pocketllm
//!
//! Settings are loaded from environment variables with sensible defaults.
//!
//! # Environment Variables
//!
//! - `POCKETLLM_SYSTEM_PROMPT`: System message for every chat turn
//! - `POCKETLLM_MAX_NEW_TOKENS`: Generation cap - default: "512"
//! - `POCKETLLM_MIN_MODEL_BYTES`: Smallest plausible model file - default: "1000000"
//! - `POCKETLLM_TOP_K`, `POCKETLLM_TOP_P`, `POCKETLLM_TEMPERATURE`, `POCKETLLM_SEED`:
//!   Sampler chain - defaults: 40, 0.9, 0.7, 42
//! - `POCKETLLM_STOP_SEQUENCES`: Comma-separated stop strings - default: role-turn markers
//! - `POCKETLLM_BACKEND_POLICY`: JSON file replacing the built-in backend policy
//! - `POCKETLLM_STATE_DIR`: Where backend history is kept, `none` to keep it in memory
//! - `POCKETLLM_LOG_LEVEL`: Logging level - default: "info"
//!
//! # Example
//!
//! ```no_run
//! use pocketllm::EngineConfig;
//!
//! std::env::set_var("POCKETLLM_MAX_NEW_TOKENS", "128");
//! let config = EngineConfig::default();
//! config.validate().expect("Invalid configuration");
//! ```

use crate::backend::HISTORY_FILE;
use crate::engine::DEFAULT_STOP_SEQUENCES;
use std::env;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Provide concise and accurate answers.";
const DEFAULT_MAX_NEW_TOKENS: usize = 512;
const MAX_NEW_TOKENS_LIMIT: usize = 32_768;
const DEFAULT_MIN_MODEL_BYTES: u64 = 1_000_000;
const DEFAULT_TOP_K: usize = 40;
const DEFAULT_TOP_P: f64 = 0.9;
const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_SEED: u64 = 42;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Disables on-disk backend history when used as `POCKETLLM_STATE_DIR`
const STATE_DIR_DISABLED: &str = "none";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Sampler chain parameters, applied as top-k, then top-p, then temperature
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub top_k: usize,
    pub top_p: f64,
    pub temperature: f64,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
            seed: DEFAULT_SEED,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// System message placed before every user prompt
    pub system_prompt: String,

    /// Most tokens sampled per generation
    pub max_new_tokens: usize,

    /// Model files smaller than this are rejected as corrupt
    pub min_model_bytes: u64,

    pub sampling: SamplingParams,

    /// Strings that end generation when they show up in the output
    pub stop_sequences: Vec<String>,

    /// JSON backend policy replacing the built-in table
    pub backend_policy: Option<PathBuf>,

    /// Directory for the backend history file, `None` keeps history in memory
    pub state_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl Default for EngineConfig {
    /// Loads from `POCKETLLM_*` environment variables, falling back to built-in defaults
    fn default() -> Self {
        let builtin = Self::builtin();

        let system_prompt =
            env::var("POCKETLLM_SYSTEM_PROMPT").unwrap_or(builtin.system_prompt);

        let sampling = SamplingParams {
            top_k: env_parse("POCKETLLM_TOP_K").unwrap_or(DEFAULT_TOP_K),
            top_p: env_parse("POCKETLLM_TOP_P").unwrap_or(DEFAULT_TOP_P),
            temperature: env_parse("POCKETLLM_TEMPERATURE").unwrap_or(DEFAULT_TEMPERATURE),
            seed: env_parse("POCKETLLM_SEED").unwrap_or(DEFAULT_SEED),
        };

        let stop_sequences = env::var("POCKETLLM_STOP_SEQUENCES")
            .ok()
            .map(|v| parse_stop_sequences(&v))
            .unwrap_or(builtin.stop_sequences);

        let state_dir = match env::var("POCKETLLM_STATE_DIR") {
            Ok(v) if v.trim().eq_ignore_ascii_case(STATE_DIR_DISABLED) => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => dirs::data_local_dir().map(|d| d.join("pocketllm")),
        };

        let log_level = env::var("POCKETLLM_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        Self {
            system_prompt,
            max_new_tokens: env_parse("POCKETLLM_MAX_NEW_TOKENS").unwrap_or(DEFAULT_MAX_NEW_TOKENS),
            min_model_bytes: env_parse("POCKETLLM_MIN_MODEL_BYTES")
                .unwrap_or(DEFAULT_MIN_MODEL_BYTES),
            sampling,
            stop_sequences,
            backend_policy: env::var("POCKETLLM_BACKEND_POLICY").ok().map(PathBuf::from),
            state_dir,
            log_level,
        }
    }
}

fn parse_stop_sequences(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl EngineConfig {
    /// Built-in defaults without consulting the environment. History stays in memory.
    pub fn builtin() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            min_model_bytes: DEFAULT_MIN_MODEL_BYTES,
            sampling: SamplingParams::default(),
            stop_sequences: DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
            backend_policy: None,
            state_dir: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value is out of range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_new_tokens == 0 || self.max_new_tokens > MAX_NEW_TOKENS_LIMIT {
            return Err(ConfigError::ValidationFailed(format!(
                "max_new_tokens must be between 1 and {}",
                MAX_NEW_TOKENS_LIMIT
            )));
        }

        if self.sampling.top_k == 0 {
            return Err(ConfigError::ValidationFailed(
                "top_k must be at least 1".to_string(),
            ));
        }
        if !(self.sampling.top_p > 0.0 && self.sampling.top_p <= 1.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "top_p must be in (0, 1], got {}",
                self.sampling.top_p
            )));
        }
        if self.sampling.temperature.is_nan() || self.sampling.temperature <= 0.0 {
            return Err(ConfigError::ValidationFailed(format!(
                "temperature must be positive, got {}",
                self.sampling.temperature
            )));
        }

        if self.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "stop sequences must not be empty strings".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    /// Location of the backend history file, when persistence is enabled
    pub fn history_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(HISTORY_FILE))
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pocketllm Configuration:")?;
        writeln!(f, "  Max New Tokens: {}", self.max_new_tokens)?;
        writeln!(f, "  Min Model Size: {} bytes", self.min_model_bytes)?;
        writeln!(
            f,
            "  Sampling: top_k={} top_p={} temperature={} seed={}",
            self.sampling.top_k, self.sampling.top_p, self.sampling.temperature, self.sampling.seed
        )?;
        writeln!(f, "  Stop Sequences: {}", self.stop_sequences.len())?;
        if let Some(ref policy) = self.backend_policy {
            writeln!(f, "  Backend Policy: {}", policy.display())?;
        }
        match self.state_dir {
            Some(ref dir) => writeln!(f, "  State Dir: {}", dir.display())?,
            None => writeln!(f, "  State Dir: (in memory)")?,
        }
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}
