//! Streaming generation loop
//!
//! Tokenize the formatted prompt, ingest it in `n_batch` chunks, then sample
//! one token at a time until end of generation, a stop string, a cap or a stop
//! request. Prefill failures fail the request; failures while sampling end it
//! early with whatever text was produced.

use super::sampler::SamplerChain;
use super::sink::TokenSink;
use super::stop::StopSequences;
use crate::config::{EngineConfig, SamplingParams};
use crate::error::EngineError;
use crate::runtime::{InferenceContext, Model, TokenBatch, TokenId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Extra room given to the first tokenize pass beyond the byte length of the text
const TOKENIZE_SLACK: usize = 100;

/// Cooperative cancellation flag shared with whoever may ask a generation to stop
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running generation to stop at its next token boundary
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Tokenizing,
    Prefilling,
    Sampling,
    Completed,
    Cancelled,
    Failed,
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndOfGeneration,
    StopSequence,
    MaxTokens,
    ContextFull,
    Cancelled,
    /// A decode failed after at least the prompt was ingested
    DecodeFailed,
}

impl FinishReason {
    pub fn terminal_state(&self) -> GenerationState {
        match self {
            FinishReason::Cancelled => GenerationState::Cancelled,
            FinishReason::DecodeFailed => GenerationState::Failed,
            _ => GenerationState::Completed,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::EndOfGeneration => "end of generation",
            FinishReason::StopSequence => "stop sequence",
            FinishReason::MaxTokens => "token limit",
            FinishReason::ContextFull => "context window full",
            FinishReason::Cancelled => "cancelled",
            FinishReason::DecodeFailed => "decode failed",
        };
        write!(f, "{}", s)
    }
}

/// Result of one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub n_prompt_tokens: usize,
    pub n_generated: usize,
}

/// Per-request knobs derived from the session configuration
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
    pub stop_sequences: StopSequences,
}

impl GenerationOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            sampling: config.sampling,
            stop_sequences: StopSequences::new(&config.stop_sequences),
        }
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::builtin())
    }
}

struct StateTracker {
    state: GenerationState,
}

impl StateTracker {
    fn transition(&mut self, next: GenerationState) {
        debug!(from = ?self.state, to = ?next, "Generation state");
        self.state = next;
    }
}

/// Tokenize `text`, growing the buffer once when the first pass reports it too small
pub fn tokenize(model: &dyn Model, text: &str, add_special: bool) -> Result<Vec<TokenId>, EngineError> {
    let mut tokens: Vec<TokenId> = vec![0; text.len() + TOKENIZE_SLACK];
    let mut n = model.tokenize(text, add_special, true, &mut tokens);

    if n < 0 {
        let required = n.unsigned_abs() as usize;
        debug!(required, initial = tokens.len(), "Token buffer too small, retrying");
        tokens.resize(required, 0);
        n = model.tokenize(text, add_special, true, &mut tokens);
        if n < 0 {
            return Err(EngineError::Tokenization(format!(
                "tokenizer still needs {} tokens after resizing to {}",
                n.unsigned_abs(),
                required
            )));
        }
    }

    if n == 0 {
        return Err(EngineError::Tokenization(
            "text produced no tokens".to_string(),
        ));
    }

    tokens.truncate(n as usize);
    Ok(tokens)
}

/// Ingest `tokens` from position 0 in chunks of at most `n_batch`, requesting logits for the final token
fn prefill(ctx: &mut dyn InferenceContext, tokens: &[TokenId]) -> Result<(), EngineError> {
    let n_batch = (ctx.n_batch() as usize).max(1);
    let mut batch = TokenBatch::new(n_batch);
    let n_chunks = tokens.len().div_ceil(n_batch);

    for (i, chunk) in tokens.chunks(n_batch).enumerate() {
        batch.clear();
        let base = i * n_batch;
        for (j, &token) in chunk.iter().enumerate() {
            batch
                .add(token, (base + j) as u32, 0, false)
                .map_err(|e| EngineError::prefill(e.to_string()))?;
        }
        if i + 1 == n_chunks {
            batch.set_last_logits(true);
        }
        ctx.decode(&batch)
            .map_err(|e| EngineError::prefill(e.to_string()))?;
    }
    Ok(())
}

/// Run one generation of `prompt` (already formatted) on `model` and `ctx`.
///
/// Clears `stop` first, so a stop requested before this call has no effect.
pub fn generate(
    model: &dyn Model,
    ctx: &mut dyn InferenceContext,
    prompt: &str,
    options: &GenerationOptions,
    stop: &StopHandle,
    sink: &mut dyn TokenSink,
) -> Result<Completion, EngineError> {
    stop.clear();
    let mut tracker = StateTracker {
        state: GenerationState::Idle,
    };

    tracker.transition(GenerationState::Tokenizing);
    let tokens = match tokenize(model, prompt, true) {
        Ok(t) => t,
        Err(e) => {
            tracker.transition(GenerationState::Failed);
            return Err(e);
        }
    };
    let n_prompt = tokens.len();
    let n_ctx = ctx.n_ctx() as usize;

    tracker.transition(GenerationState::Prefilling);
    ctx.clear_memory();
    if n_prompt >= n_ctx {
        tracker.transition(GenerationState::Failed);
        return Err(EngineError::prefill(format!(
            "prompt of {} tokens does not fit the {} token context",
            n_prompt, n_ctx
        )));
    }
    if let Err(e) = prefill(ctx, &tokens) {
        tracker.transition(GenerationState::Failed);
        return Err(e);
    }
    debug!(tokens = n_prompt, "Prompt ingested");

    tracker.transition(GenerationState::Sampling);
    let mut sampler = SamplerChain::new(options.sampling);
    let mut batch = TokenBatch::new(1);
    let mut text = String::new();
    let mut n_cur = n_prompt;
    let mut n_generated = 0usize;

    let finish_reason = loop {
        if stop.is_requested() {
            info!(generated = n_generated, "Generation stopped on request");
            break FinishReason::Cancelled;
        }
        if n_generated >= options.max_new_tokens {
            break FinishReason::MaxTokens;
        }

        let token = match ctx.logits_ith(-1) {
            Some(logits) => match sampler.sample(logits) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Sampling failed: {}", e);
                    break FinishReason::DecodeFailed;
                }
            },
            None => {
                warn!("Context returned no logits");
                break FinishReason::DecodeFailed;
            }
        };

        if model.is_eog(token) {
            break FinishReason::EndOfGeneration;
        }

        let piece = match model.token_to_piece(token) {
            Ok(p) => p,
            Err(e) => {
                warn!(token, "Failed to convert token to text: {}", e);
                break FinishReason::DecodeFailed;
            }
        };
        text.push_str(&piece);
        n_generated += 1;
        trace!(token, piece = %piece, "Token");
        sink.on_token(&piece);

        if let Some(matched) = options.stop_sequences.find_match(&text, &piece) {
            debug!(stop = matched, "Stop sequence matched");
            StopSequences::truncate_at(&mut text, matched);
            break FinishReason::StopSequence;
        }

        if n_cur >= n_ctx {
            break FinishReason::ContextFull;
        }

        batch.clear();
        if let Err(e) = batch.add(token, n_cur as u32, 0, true) {
            warn!("{}", e);
            break FinishReason::DecodeFailed;
        }
        if let Err(e) = ctx.decode(&batch) {
            warn!(position = n_cur, "Decode failed during generation: {}", e);
            break FinishReason::DecodeFailed;
        }
        n_cur += 1;
    };

    tracker.transition(finish_reason.terminal_state());
    sink.on_finish(finish_reason);
    info!(
        prompt_tokens = n_prompt,
        generated = n_generated,
        reason = %finish_reason,
        "Generation finished"
    );

    Ok(Completion {
        text,
        finish_reason,
        n_prompt_tokens: n_prompt,
        n_generated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{ContextParams, ModelLoader, ModelParams};
    use std::path::Path;

    fn load(runtime: &MockRuntime, n_ctx: u32, n_batch: u32) -> (Box<dyn Model>, Box<dyn InferenceContext>) {
        let model = runtime
            .load_model(Path::new("m.gguf"), &ModelParams::default())
            .unwrap();
        let ctx = model
            .new_context(&ContextParams {
                n_ctx,
                n_batch,
                embeddings: false,
            })
            .unwrap();
        (model, ctx)
    }

    fn run(
        runtime: &MockRuntime,
        prompt: &str,
        options: &GenerationOptions,
    ) -> (Result<Completion, EngineError>, Vec<String>) {
        let (model, mut ctx) = load(runtime, 2048, 512);
        let mut pieces = Vec::new();
        let mut sink = |p: &str| pieces.push(p.to_string());
        let result = generate(
            model.as_ref(),
            ctx.as_mut(),
            prompt,
            options,
            &StopHandle::new(),
            &mut sink,
        );
        (result, pieces)
    }

    #[test]
    fn test_tokenize_grows_buffer_once() {
        let runtime = MockRuntime::new().tokens_per_char(3);
        let (model, _ctx) = load(&runtime, 2048, 512);
        let text = "x".repeat(80);

        let tokens = tokenize(model.as_ref(), &text, false).unwrap();
        assert_eq!(tokens.len(), 240);
        assert_eq!(runtime.tokenized().len(), 2);
    }

    #[test]
    fn test_tokenize_empty_result_is_error() {
        let runtime = MockRuntime::new().empty_tokenization();
        let (model, _ctx) = load(&runtime, 2048, 512);
        assert!(matches!(
            tokenize(model.as_ref(), "hello", true),
            Err(EngineError::Tokenization(_))
        ));
    }

    #[test]
    fn test_prefill_chunks_by_batch_size() {
        let runtime = MockRuntime::new().script_pieces(&["ok"]);
        let (model, mut ctx) = load(&runtime, 2048, 4);
        let mut sink = |_: &str| {};
        let completion = generate(
            model.as_ref(),
            ctx.as_mut(),
            "abcdefghij",
            &GenerationOptions::default(),
            &StopHandle::new(),
            &mut sink,
        )
        .unwrap();

        // BOS + 10 chars = 11 prompt tokens, then one sampled token fed back
        assert_eq!(completion.n_prompt_tokens, 11);
        assert_eq!(runtime.decode_batches(), vec![4, 4, 3, 1]);
        assert_eq!(completion.text, "ok");
    }

    #[test]
    fn test_stream_ends_on_eog() {
        let runtime = MockRuntime::new().script_pieces(&["Hel", "lo"]);
        let (result, pieces) = run(&runtime, "hi", &GenerationOptions::default());
        let completion = result.unwrap();
        assert_eq!(completion.text, "Hello");
        assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
        assert_eq!(pieces, vec!["Hel", "lo"]);
    }

    #[test]
    fn test_max_tokens_cap() {
        let runtime = MockRuntime::new().script_pieces(&["a", "b", "c", "d"]);
        let options = GenerationOptions {
            max_new_tokens: 2,
            ..GenerationOptions::default()
        };
        let completion = run(&runtime, "hi", &options).0.unwrap();
        assert_eq!(completion.text, "ab");
        assert_eq!(completion.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_context_window_cap() {
        let runtime = MockRuntime::new().script_pieces(&["a", "b", "c", "d", "e"]);
        // "hi" + BOS = 3 prompt tokens, room for 2 more positions
        let (model, mut ctx) = load(&runtime, 5, 512);
        let mut sink = |_: &str| {};
        let completion = generate(
            model.as_ref(),
            ctx.as_mut(),
            "hi",
            &GenerationOptions::default(),
            &StopHandle::new(),
            &mut sink,
        )
        .unwrap();
        assert_eq!(completion.finish_reason, FinishReason::ContextFull);
        assert_eq!(completion.text, "abc");
    }

    #[test]
    fn test_prompt_longer_than_context_fails() {
        let runtime = MockRuntime::new();
        let (model, mut ctx) = load(&runtime, 4, 512);
        let mut sink = |_: &str| {};
        let err = generate(
            model.as_ref(),
            ctx.as_mut(),
            "far too long",
            &GenerationOptions::default(),
            &StopHandle::new(),
            &mut sink,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Decode { .. }));
    }

    #[test]
    fn test_finish_reason_states() {
        assert_eq!(
            FinishReason::Cancelled.terminal_state(),
            GenerationState::Cancelled
        );
        assert_eq!(
            FinishReason::DecodeFailed.terminal_state(),
            GenerationState::Failed
        );
        assert_eq!(
            FinishReason::StopSequence.terminal_state(),
            GenerationState::Completed
        );
    }
}
