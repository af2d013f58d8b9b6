//! Token sinks receiving generated pieces as they are produced

use super::generate::{FinishReason, StopHandle};
use crate::error::EngineError;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// Receives each generated piece synchronously from the generation loop.
///
/// A slow sink throttles generation directly; nothing is buffered in between.
pub trait TokenSink {
    fn on_token(&mut self, piece: &str);

    /// Called once when generation ends, before the completion is returned
    fn on_finish(&mut self, _reason: FinishReason) {}
}

impl<F> TokenSink for F
where
    F: FnMut(&str),
{
    fn on_token(&mut self, piece: &str) {
        self(piece)
    }
}

/// Forwards pieces into a single-consumer channel.
///
/// With a stop handle attached, a dropped receiver requests a stop so the
/// generation ends at the next token boundary.
#[derive(Debug)]
pub struct ChannelSink {
    tx: UnboundedSender<Result<String, EngineError>>,
    stop: Option<StopHandle>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<Result<String, EngineError>>) -> Self {
        Self { tx, stop: None }
    }

    pub fn with_stop(tx: UnboundedSender<Result<String, EngineError>>, stop: StopHandle) -> Self {
        Self {
            tx,
            stop: Some(stop),
        }
    }

    /// True once the receiving side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Deliver a terminal error to the consumer
    pub fn fail(&self, error: EngineError) {
        let _ = self.tx.send(Err(error));
    }
}

impl TokenSink for ChannelSink {
    fn on_token(&mut self, piece: &str) {
        if self.tx.send(Ok(piece.to_string())).is_err() {
            trace!("Token receiver dropped, discarding piece");
            if let Some(stop) = &self.stop {
                stop.request();
            }
        }
    }
}
