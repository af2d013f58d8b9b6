//! Scripted in-process runtime
//!
//! Behaves like a real inference library closely enough to drive the whole
//! session manager without model files: backends can be made to fail, decode
//! calls can be made to fail or trigger side effects, and the sampled token
//! stream is fixed in advance.

use super::template::apply_builtin;
use super::{
    ChatMessage, ContextParams, InferenceContext, Model, ModelLoader, ModelParams, RuntimeError,
    TokenBatch, TokenId,
};
use crate::backend::ComputeBackend;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Beginning-of-sequence token prepended when `add_special` is set
pub const BOS_TOKEN: TokenId = 1;
/// Default end-of-generation token
pub const EOG_TOKEN: TokenId = 2;
/// First id handed out by [`MockRuntime::script_pieces`]
pub const FIRST_SCRIPT_TOKEN: TokenId = 100;

const PEAK_LOGIT: f32 = 50.0;

/// Called with the 1-based number of every decode call before it runs
pub type DecodeHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Clone)]
struct MockConfig {
    failing: HashSet<ComputeBackend>,
    script: Vec<TokenId>,
    pieces: HashMap<TokenId, String>,
    eog: TokenId,
    native_template: Option<String>,
    fail_decode_at: Option<usize>,
    decode_hook: Option<DecodeHook>,
    fail_context: bool,
    tokens_per_char: usize,
    empty_tokenization: bool,
    embedding: Vec<f32>,
    pooled_embeddings: bool,
    n_ctx_train: u32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            failing: HashSet::new(),
            script: Vec::new(),
            pieces: HashMap::new(),
            eog: EOG_TOKEN,
            native_template: Some("chatml".to_string()),
            fail_decode_at: None,
            decode_hook: None,
            fail_context: false,
            tokens_per_char: 1,
            empty_tokenization: false,
            embedding: vec![3.0, 4.0],
            pooled_embeddings: true,
            n_ctx_train: 4096,
        }
    }
}

#[derive(Default)]
struct MockStats {
    attempts: Mutex<Vec<ComputeBackend>>,
    live_models: AtomicUsize,
    live_contexts: AtomicUsize,
    decode_calls: AtomicUsize,
    decode_batches: Mutex<Vec<usize>>,
    tokenized: Mutex<Vec<String>>,
    template_calls: Mutex<Vec<(String, usize)>>,
    drop_order_violations: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`ModelLoader`] with scripted behaviour and observable side effects
#[derive(Clone, Default)]
pub struct MockRuntime {
    config: Arc<MockConfig>,
    stats: Arc<MockStats>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn config_mut(&mut self) -> &mut MockConfig {
        Arc::make_mut(&mut self.config)
    }

    /// Loading on `backend` fails
    pub fn fail_backend(mut self, backend: ComputeBackend) -> Self {
        self.config_mut().failing.insert(backend);
        self
    }

    /// Sample `pieces` in order, then end of generation
    pub fn script_pieces(mut self, pieces: &[&str]) -> Self {
        let config = self.config_mut();
        config.script.clear();
        for (i, piece) in pieces.iter().enumerate() {
            let id = FIRST_SCRIPT_TOKEN + i as TokenId;
            config.script.push(id);
            config.pieces.insert(id, piece.to_string());
        }
        self
    }

    /// Sample exactly `tokens` in order, then end of generation
    pub fn script_tokens(mut self, tokens: &[TokenId]) -> Self {
        self.config_mut().script = tokens.to_vec();
        self
    }

    pub fn piece(mut self, token: TokenId, piece: &str) -> Self {
        self.config_mut().pieces.insert(token, piece.to_string());
        self
    }

    pub fn eog_token(mut self, token: TokenId) -> Self {
        self.config_mut().eog = token;
        self
    }

    /// Template embedded in the mock model file, `None` for none
    pub fn native_template(mut self, template: Option<&str>) -> Self {
        self.config_mut().native_template = template.map(str::to_string);
        self
    }

    /// The `n`-th decode call (1-based) fails
    pub fn fail_decode_at(mut self, n: usize) -> Self {
        self.config_mut().fail_decode_at = Some(n);
        self
    }

    pub fn on_decode(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.config_mut().decode_hook = Some(Arc::new(hook));
        self
    }

    pub fn fail_context_creation(mut self) -> Self {
        self.config_mut().fail_context = true;
        self
    }

    /// Emit `n` tokens per input character so a first tokenize pass overflows
    pub fn tokens_per_char(mut self, n: usize) -> Self {
        self.config_mut().tokens_per_char = n.max(1);
        self
    }

    /// Tokenizer produces nothing for any input
    pub fn empty_tokenization(mut self) -> Self {
        self.config_mut().empty_tokenization = true;
        self
    }

    pub fn embedding(mut self, vector: Vec<f32>) -> Self {
        self.config_mut().embedding = vector;
        self
    }

    /// Without pooling only the raw embedding buffer is populated
    pub fn pooled_embeddings(mut self, pooled: bool) -> Self {
        self.config_mut().pooled_embeddings = pooled;
        self
    }

    /// Backends `load_model` was called with, in order
    pub fn attempts(&self) -> Vec<ComputeBackend> {
        lock(&self.stats.attempts).clone()
    }

    pub fn live_models(&self) -> usize {
        self.stats.live_models.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.stats.live_contexts.load(Ordering::SeqCst)
    }

    pub fn decode_calls(&self) -> usize {
        self.stats.decode_calls.load(Ordering::SeqCst)
    }

    /// Size of every decoded batch, in order
    pub fn decode_batches(&self) -> Vec<usize> {
        lock(&self.stats.decode_batches).clone()
    }

    /// Every text handed to the tokenizer, in order
    pub fn tokenized(&self) -> Vec<String> {
        lock(&self.stats.tokenized).clone()
    }

    /// `(template, buffer length)` of every template application
    pub fn template_calls(&self) -> Vec<(String, usize)> {
        lock(&self.stats.template_calls).clone()
    }

    /// Contexts that outlived their model
    pub fn drop_order_violations(&self) -> usize {
        self.stats.drop_order_violations.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn load_model(&self, _path: &Path, params: &ModelParams) -> Result<Box<dyn Model>, RuntimeError> {
        lock(&self.stats.attempts).push(params.backend);

        if self.config.failing.contains(&params.backend) {
            return Err(RuntimeError::BackendUnavailable {
                backend: params.backend,
                reason: "injected failure".to_string(),
            });
        }
        if params.backend.is_accelerator() && !params.accelerators.allows(params.backend) {
            return Err(RuntimeError::BackendUnavailable {
                backend: params.backend,
                reason: "disabled for this attempt".to_string(),
            });
        }

        self.stats.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockModel {
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MockModel {
    config: Arc<MockConfig>,
    stats: Arc<MockStats>,
    alive: Arc<AtomicBool>,
}

impl MockModel {
    fn vocab_size(&self) -> usize {
        let max_script = self.config.script.iter().copied().max().unwrap_or(0);
        max_script.max(self.config.eog) as usize + 1
    }
}

impl Model for MockModel {
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>, RuntimeError> {
        if self.config.fail_context {
            return Err(RuntimeError::Context("injected failure".to_string()));
        }
        self.stats.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            model_alive: Arc::clone(&self.alive),
            params: *params,
            vocab_size: self.vocab_size(),
            n_past: 0,
            step: 0,
            logits: Vec::new(),
            embedding: None,
        }))
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool, out: &mut [TokenId]) -> i32 {
        lock(&self.stats.tokenized).push(text.to_string());
        if self.config.empty_tokenization {
            return 0;
        }

        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS_TOKEN);
        }
        for c in text.chars() {
            for _ in 0..self.config.tokens_per_char {
                tokens.push(c as TokenId);
            }
        }

        let n = i32::try_from(tokens.len()).unwrap_or(i32::MAX);
        if tokens.len() > out.len() {
            return -n;
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        n
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String, RuntimeError> {
        Ok(self
            .config
            .pieces
            .get(&token)
            .cloned()
            .unwrap_or_else(|| format!("<{token}>")))
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == self.config.eog
    }

    fn chat_template(&self) -> Option<String> {
        self.config.native_template.clone()
    }

    fn apply_chat_template(
        &self,
        template: &str,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32 {
        lock(&self.stats.template_calls).push((template.to_string(), buf.len()));
        apply_builtin(template, messages, add_assistant, buf)
    }

    fn n_ctx_train(&self) -> u32 {
        self.config.n_ctx_train
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.stats.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockContext {
    config: Arc<MockConfig>,
    stats: Arc<MockStats>,
    model_alive: Arc<AtomicBool>,
    params: ContextParams,
    vocab_size: usize,
    n_past: u32,
    /// Logits-producing decodes since the memory was last cleared
    step: usize,
    logits: Vec<f32>,
    embedding: Option<Vec<f32>>,
}

impl InferenceContext for MockContext {
    fn n_ctx(&self) -> u32 {
        self.params.n_ctx
    }

    fn n_batch(&self) -> u32 {
        self.params.n_batch
    }

    fn clear_memory(&mut self) {
        self.n_past = 0;
        self.step = 0;
        self.logits.clear();
        self.embedding = None;
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError> {
        let call = self.stats.decode_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.config.decode_hook {
            hook(call);
        }
        if self.config.fail_decode_at == Some(call) {
            return Err(RuntimeError::Decode(format!("injected failure at call {call}")));
        }

        if batch.is_empty() {
            return Err(RuntimeError::Decode("empty batch".to_string()));
        }
        if batch.len() > self.params.n_batch as usize {
            return Err(RuntimeError::Decode(format!(
                "batch of {} exceeds n_batch {}",
                batch.len(),
                self.params.n_batch
            )));
        }
        for (i, entry) in batch.entries().iter().enumerate() {
            let expected = self.n_past + i as u32;
            if entry.pos != expected {
                return Err(RuntimeError::Decode(format!(
                    "position {} out of order, expected {}",
                    entry.pos, expected
                )));
            }
            if entry.pos >= self.params.n_ctx {
                return Err(RuntimeError::Decode("context is full".to_string()));
            }
        }

        lock(&self.stats.decode_batches).push(batch.len());
        self.n_past += batch.len() as u32;

        if batch.n_outputs() > 0 {
            if self.params.embeddings {
                self.embedding = Some(self.config.embedding.clone());
            } else {
                let next = self
                    .config
                    .script
                    .get(self.step)
                    .copied()
                    .unwrap_or(self.config.eog);
                self.logits = vec![0.0; self.vocab_size];
                self.logits[next as usize] = PEAK_LOGIT;
                self.step += 1;
            }
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
        if self.config.pooled_embeddings {
            self.embedding.as_deref()
        } else {
            None
        }
    }

    fn embeddings_raw(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        if !self.model_alive.load(Ordering::SeqCst) {
            self.stats.drop_order_violations.fetch_add(1, Ordering::SeqCst);
        }
        self.stats.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(runtime: &MockRuntime) -> Box<dyn Model> {
        runtime
            .load_model(Path::new("m.gguf"), &ModelParams::default())
            .unwrap()
    }

    #[test]
    fn test_injected_backend_failure() {
        let runtime = MockRuntime::new().fail_backend(ComputeBackend::Vulkan);
        let params = ModelParams::for_backend(ComputeBackend::Vulkan, true);
        assert!(runtime.load_model(Path::new("m"), &params).is_err());
        assert_eq!(runtime.attempts(), vec![ComputeBackend::Vulkan]);
        assert_eq!(runtime.live_models(), 0);
    }

    #[test]
    fn test_tokenize_reports_required_size() {
        let runtime = MockRuntime::new().tokens_per_char(4);
        let model = load(&runtime);
        let mut small = vec![0; 3];
        assert_eq!(model.tokenize("ab", false, true, &mut small), -8);
        let mut big = vec![0; 8];
        assert_eq!(model.tokenize("ab", false, true, &mut big), 8);
    }

    #[test]
    fn test_scripted_logits_follow_script() {
        let runtime = MockRuntime::new().script_pieces(&["a", "b"]);
        let model = load(&runtime);
        let mut ctx = model
            .new_context(&ContextParams::default())
            .unwrap();

        let mut batch = TokenBatch::new(4);
        batch.add(5, 0, 0, true).unwrap();
        ctx.decode(&batch).unwrap();
        let logits = ctx.logits_ith(-1).unwrap();
        assert_eq!(logits[FIRST_SCRIPT_TOKEN as usize], PEAK_LOGIT);

        batch.clear();
        batch.add(FIRST_SCRIPT_TOKEN, 1, 0, true).unwrap();
        ctx.decode(&batch).unwrap();
        assert_eq!(ctx.logits_ith(-1).unwrap()[FIRST_SCRIPT_TOKEN as usize + 1], PEAK_LOGIT);
    }

    #[test]
    fn test_out_of_order_position_rejected() {
        let runtime = MockRuntime::new();
        let model = load(&runtime);
        let mut ctx = model.new_context(&ContextParams::default()).unwrap();
        let mut batch = TokenBatch::new(1);
        batch.add(5, 3, 0, true).unwrap();
        assert!(ctx.decode(&batch).is_err());
    }

    #[test]
    fn test_live_counters_and_drop_order() {
        let runtime = MockRuntime::new();
        let model = load(&runtime);
        let ctx = model.new_context(&ContextParams::default()).unwrap();
        assert_eq!((runtime.live_models(), runtime.live_contexts()), (1, 1));

        drop(model);
        drop(ctx);
        assert_eq!((runtime.live_models(), runtime.live_contexts()), (0, 0));
        assert_eq!(runtime.drop_order_violations(), 1);
    }
}
