//! Token generation and embedding on a loaded model
//!
//! The synchronous core ([`generate()`], [`embed()`]) works on any
//! [`crate::runtime::Model`] and context pair. [`LlmEngine`] wraps a
//! [`crate::Session`] for async callers and exposes completions as a stream.

mod embed;
mod generate;
mod sampler;
mod sink;
mod stop;
mod stream;

pub use embed::{cosine_similarity, embed, l2_normalize};
pub use generate::{
    generate, tokenize, Completion, FinishReason, GenerationOptions, GenerationState, StopHandle,
};
pub use sampler::SamplerChain;
pub use sink::{ChannelSink, TokenSink};
pub use stop::{StopSequences, DEFAULT_STOP_SEQUENCES};
pub use stream::{CompletionStream, LlmEngine};
