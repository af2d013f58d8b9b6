//! Candle inference runtime for quantized GGUF models

use super::template::apply_builtin;
use super::{
    ChatMessage, ContextParams, InferenceContext, Model, ModelLoader, ModelParams, RuntimeError,
    TokenBatch, TokenId,
};
use crate::backend::ComputeBackend;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::quantized_qwen2::ModelWeights as QuantizedQwen2;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

const META_CHAT_TEMPLATE: &str = "tokenizer.chat_template";
const META_EOS_TOKEN: &str = "tokenizer.ggml.eos_token_id";
const META_ARCHITECTURE: &str = "general.architecture";

/// Turn terminators recognised as end of generation when present in the vocabulary
const END_OF_TURN_MARKERS: &[&str] = &[
    "<|im_end|>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|end|>",
    "<end_of_turn>",
    "</s>",
];

const DEFAULT_CTX_TRAIN: u32 = 4096;

type WeightsSlot = Arc<Mutex<Option<QuantizedQwen2>>>;

fn take_slot(slot: &WeightsSlot) -> Option<QuantizedQwen2> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

fn candle_err(e: candle_core::Error) -> RuntimeError {
    RuntimeError::Other(e.to_string())
}

/// Loads Qwen2-family GGUF files with a sibling `tokenizer.json`
#[derive(Debug, Default, Clone)]
pub struct CandleLoader;

impl CandleLoader {
    pub fn new() -> Self {
        Self
    }

    /// `tokenizer.json` next to the model, or `<stem>.tokenizer.json`
    pub fn tokenizer_path(model_path: &Path) -> Option<PathBuf> {
        let dir = model_path.parent().unwrap_or_else(|| Path::new("."));
        let stem = model_path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        [
            dir.join(format!("{stem}.tokenizer.json")),
            dir.join("tokenizer.json"),
        ]
        .into_iter()
        .find(|p| p.exists())
    }

    fn device_for(params: &ModelParams) -> Result<Device, RuntimeError> {
        if params.n_gpu_layers == 0 || !params.backend.is_accelerator() {
            return Ok(Device::Cpu);
        }
        if !params.accelerators.allows(params.backend) {
            return Err(RuntimeError::BackendUnavailable {
                backend: params.backend,
                reason: "disabled for this attempt".to_string(),
            });
        }
        accelerator_device(params.backend)
    }
}

#[cfg(feature = "cuda")]
fn accelerator_device(backend: ComputeBackend) -> Result<Device, RuntimeError> {
    Device::new_cuda(0).map_err(|e| RuntimeError::BackendUnavailable {
        backend,
        reason: format!("failed to create CUDA device: {e}"),
    })
}

#[cfg(all(feature = "metal", not(feature = "cuda")))]
fn accelerator_device(backend: ComputeBackend) -> Result<Device, RuntimeError> {
    Device::new_metal(0).map_err(|e| RuntimeError::BackendUnavailable {
        backend,
        reason: format!("failed to create Metal device: {e}"),
    })
}

#[cfg(not(any(feature = "cuda", feature = "metal")))]
fn accelerator_device(backend: ComputeBackend) -> Result<Device, RuntimeError> {
    Err(RuntimeError::BackendUnavailable {
        backend,
        reason: "not compiled with an accelerator feature".to_string(),
    })
}

impl ModelLoader for CandleLoader {
    fn name(&self) -> &str {
        "candle"
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Box<dyn Model>, RuntimeError> {
        let device = Self::device_for(params)?;
        debug!(backend = %params.backend, mmap = params.use_mmap, "Loading GGUF model from: {}", path.display());

        let tokenizer_path = Self::tokenizer_path(path).ok_or_else(|| {
            RuntimeError::Tokenizer(format!("no tokenizer.json next to {}", path.display()))
        })?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| RuntimeError::Tokenizer(format!("failed to load tokenizer: {e}")))?;

        let mut file = std::fs::File::open(path)
            .map_err(|e| RuntimeError::Load(format!("failed to open GGUF model file: {e}")))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| RuntimeError::Load(format!("failed to read GGUF file: {e}")))?;

        let chat_template = content
            .metadata
            .get(META_CHAT_TEMPLATE)
            .and_then(|v| v.to_string().ok())
            .cloned();
        let n_ctx_train = content
            .metadata
            .get(META_ARCHITECTURE)
            .and_then(|v| v.to_string().ok())
            .and_then(|arch| content.metadata.get(&format!("{arch}.context_length")))
            .and_then(|v| v.to_u32().ok())
            .unwrap_or(DEFAULT_CTX_TRAIN);

        let mut eog: HashSet<TokenId> = END_OF_TURN_MARKERS
            .iter()
            .filter_map(|m| tokenizer.token_to_id(m))
            .collect();
        if let Some(eos) = content
            .metadata
            .get(META_EOS_TOKEN)
            .and_then(|v| v.to_u32().ok())
        {
            eog.insert(eos);
        }
        if eog.is_empty() {
            warn!("Model declares no end-of-generation token, relying on stop sequences");
        }

        let weights = QuantizedQwen2::from_gguf(content, &mut file, &device)
            .map_err(|e| RuntimeError::Load(format!("failed to load model weights: {e}")))?;

        info!(
            backend = %params.backend,
            ctx_train = n_ctx_train,
            native_template = chat_template.is_some(),
            "GGUF model loaded"
        );

        Ok(Box::new(CandleModel {
            weights: Arc::new(Mutex::new(Some(weights))),
            tokenizer,
            device,
            chat_template,
            eog,
            n_ctx_train,
        }))
    }
}

struct CandleModel {
    weights: WeightsSlot,
    tokenizer: Tokenizer,
    device: Device,
    chat_template: Option<String>,
    eog: HashSet<TokenId>,
    n_ctx_train: u32,
}

impl Model for CandleModel {
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>, RuntimeError> {
        // The KV cache lives inside the weights, so they move into the one live context
        let weights = take_slot(&self.weights).ok_or_else(|| {
            RuntimeError::Context("model already has a live context".to_string())
        })?;
        if params.embeddings {
            debug!("Quantized decoder has no pooling head, embeddings will be unavailable");
        }
        Ok(Box::new(CandleContext {
            weights: Some(weights),
            home: Arc::clone(&self.weights),
            device: self.device.clone(),
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            n_past: 0,
            logits: Vec::new(),
        }))
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool, out: &mut [TokenId]) -> i32 {
        let encoding = match self.tokenizer.encode(text, add_special) {
            Ok(e) => e,
            Err(e) => {
                warn!("Tokenizer rejected input: {}", e);
                return 0;
            }
        };
        let ids = encoding.get_ids();
        let n = i32::try_from(ids.len()).unwrap_or(i32::MAX);
        if ids.len() > out.len() {
            return -n;
        }
        out[..ids.len()].copy_from_slice(ids);
        n
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String, RuntimeError> {
        self.tokenizer
            .decode(&[token], false)
            .map_err(|e| RuntimeError::Tokenizer(e.to_string()))
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.eog.contains(&token)
    }

    fn chat_template(&self) -> Option<String> {
        self.chat_template.clone()
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32 {
        apply_builtin(template, messages, add_assistant, buf)
    }

    fn n_ctx_train(&self) -> u32 {
        self.n_ctx_train
    }
}

struct CandleContext {
    weights: Option<QuantizedQwen2>,
    home: WeightsSlot,
    device: Device,
    n_ctx: u32,
    n_batch: u32,
    n_past: u32,
    logits: Vec<f32>,
}

impl CandleContext {
    fn forward(&mut self, tokens: &[TokenId], index_pos: usize) -> Result<Tensor, RuntimeError> {
        let weights = self
            .weights
            .as_mut()
            .ok_or_else(|| RuntimeError::Decode("context has no weights".to_string()))?;
        let input = Tensor::new(tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(candle_err)?;
        weights
            .forward(&input, index_pos)
            .map_err(|e| RuntimeError::Decode(e.to_string()))
    }

    fn last_logits(logits: Tensor) -> Result<Vec<f32>, RuntimeError> {
        // [batch, seq, vocab] from full models, [batch, vocab] from quantized ones
        let logits = if logits.dims().len() == 3 {
            let seq_len = logits.dim(1).map_err(candle_err)?;
            logits.i((0, seq_len - 1)).map_err(candle_err)?
        } else {
            logits.squeeze(0).map_err(candle_err)?
        };
        logits
            .to_dtype(DType::F32)
            .and_then(|l| l.to_vec1::<f32>())
            .map_err(candle_err)
    }
}

impl InferenceContext for CandleContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_batch(&self) -> u32 {
        self.n_batch
    }

    fn clear_memory(&mut self) {
        // The next forward at position 0 drops the cached keys and values
        self.n_past = 0;
        self.logits.clear();
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError> {
        if batch.is_empty() {
            return Err(RuntimeError::Decode("empty batch".to_string()));
        }
        if batch.len() > self.n_batch as usize {
            return Err(RuntimeError::Decode(format!(
                "batch of {} exceeds n_batch {}",
                batch.len(),
                self.n_batch
            )));
        }
        for (i, entry) in batch.entries().iter().enumerate() {
            if entry.pos != self.n_past + i as u32 {
                return Err(RuntimeError::Decode(format!(
                    "non-contiguous position {} (expected {})",
                    entry.pos,
                    self.n_past + i as u32
                )));
            }
        }
        if self.n_past + batch.len() as u32 > self.n_ctx {
            return Err(RuntimeError::Decode("context is full".to_string()));
        }

        let tokens: Vec<TokenId> = batch.tokens().collect();
        let start = self.n_past as usize;
        // The causal mask only covers the current chunk, so later chunks go one token at a time
        let logits = if start == 0 || tokens.len() == 1 {
            self.forward(&tokens, start)?
        } else {
            let mut last = None;
            for (i, token) in tokens.iter().enumerate() {
                last = Some(self.forward(&[*token], start + i)?);
            }
            last.ok_or_else(|| RuntimeError::Decode("empty batch".to_string()))?
        };
        self.n_past += tokens.len() as u32;

        if batch.n_outputs() > 0 {
            self.logits = Self::last_logits(logits)?;
        } else {
            self.logits.clear();
        }
        Ok(())
    }

    fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        if self.logits.is_empty() || !(i == -1 || i == 0) {
            return None;
        }
        Some(&self.logits)
    }

    fn embeddings_seq(&self, _seq_id: i32) -> Option<&[f32]> {
        None
    }

    fn embeddings_raw(&self) -> Option<&[f32]> {
        None
    }
}

impl Drop for CandleContext {
    fn drop(&mut self) {
        if let Some(weights) = self.weights.take() {
            let mut home = self
                .home
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *home = Some(weights);
        }
    }
}
