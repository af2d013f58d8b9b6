//! Sentence embeddings from a loaded context

use super::generate::tokenize;
use crate::error::EngineError;
use crate::runtime::{InferenceContext, Model, TokenBatch};
use tracing::debug;

/// Embed `text` in one decode and return the L2-normalised vector.
///
/// Empty text yields an empty vector. The whole input must fit in one batch.
pub fn embed(
    model: &dyn Model,
    ctx: &mut dyn InferenceContext,
    text: &str,
) -> Result<Vec<f32>, EngineError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    ctx.clear_memory();
    let tokens = tokenize(model, text, true)?;

    let mut batch = TokenBatch::new(tokens.len());
    for (i, &token) in tokens.iter().enumerate() {
        batch
            .add(token, i as u32, 0, false)
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
    }
    batch.set_last_logits(true);

    ctx.decode(&batch)
        .map_err(|e| EngineError::Embedding(format!("decode failed: {e}")))?;

    let ctx: &dyn InferenceContext = ctx;
    let raw = match ctx.embeddings_seq(0) {
        Some(v) => v,
        None => {
            debug!("No pooled embedding, using raw embedding buffer");
            ctx.embeddings_raw().ok_or_else(|| {
                EngineError::Embedding("context produced no embeddings".to_string())
            })?
        }
    };

    let mut vector = raw.to_vec();
    l2_normalize(&mut vector);
    debug!(tokens = tokens.len(), dims = vector.len(), "Text embedded");
    Ok(vector)
}

/// Divide every component by the Euclidean norm. Zero vectors are left as they are.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity of two vectors, `0.0` when lengths differ or either is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
