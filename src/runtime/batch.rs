//! Fixed-capacity token batch submitted to a decode call

use super::TokenId;
use thiserror::Error;

/// One token slot of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: u32,
    pub seq_id: i32,
    pub logits: bool,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("token batch is full (capacity {capacity})")]
pub struct BatchFull {
    pub capacity: usize,
}

/// Ordered token slots with a capacity fixed at construction
#[derive(Debug, Clone)]
pub struct TokenBatch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl TokenBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, token: TokenId, pos: u32, seq_id: i32, logits: bool) -> Result<(), BatchFull> {
        if self.entries.len() >= self.capacity {
            return Err(BatchFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_id,
            logits,
        });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Toggle logits on the last entry; no-op on an empty batch
    pub fn set_last_logits(&mut self, logits: bool) {
        if let Some(last) = self.entries.last_mut() {
            last.logits = logits;
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn tokens(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.entries.iter().map(|e| e.token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries that request logits
    pub fn n_outputs(&self) -> usize {
        self.entries.iter().filter(|e| e.logits).count()
    }
}
