//! Async front end over a [`Session`]
//!
//! Every blocking call (load, decode, embed) runs on the blocking pool while
//! holding the session lock, so at most one operation touches the models at a
//! time. Stopping never takes the lock.

use super::generate::{Completion, StopHandle};
use super::sink::ChannelSink;
use crate::backend::ComputeBackend;
use crate::error::{EngineError, Result};
use crate::hardware::DeviceTuning;
use crate::runtime::RuntimeError;
use crate::session::{HardwareInfo, Session};
use futures_util::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Cloneable handle to a shared session
#[derive(Debug, Clone)]
pub struct LlmEngine {
    session: Arc<Mutex<Session>>,
    stop: StopHandle,
}

fn worker_failed(e: tokio::task::JoinError) -> EngineError {
    EngineError::Runtime(RuntimeError::Other(format!("worker task failed: {e}")))
}

impl LlmEngine {
    pub fn new(session: Session) -> Self {
        let stop = session.stop_handle();
        Self {
            session: Arc::new(Mutex::new(session)),
            stop,
        }
    }

    /// Run `f` on the blocking pool with the session locked
    async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    {
        let mut guard = Arc::clone(&self.session).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *guard))
            .await
            .map_err(worker_failed)?
    }

    pub async fn load_chat_model(
        &self,
        path: impl Into<PathBuf>,
        template: Option<String>,
        batch_size: u32,
        context_size: u32,
        use_mmap: bool,
    ) -> Result<()> {
        let path = path.into();
        self.with_session(move |s| {
            s.load_chat(&path, template.as_deref(), batch_size, context_size, use_mmap)
        })
        .await
    }

    /// Load a chat model with parameters tuned for this device
    pub async fn load_chat_model_tuned(
        &self,
        path: impl Into<PathBuf>,
        template: Option<String>,
    ) -> Result<()> {
        let path = path.into();
        self.with_session(move |s| s.load_chat_tuned(&path, template.as_deref()))
            .await
    }

    pub async fn load_embedding_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.with_session(move |s| s.load_embedding(&path)).await
    }

    pub async fn embed(&self, text: impl Into<String>) -> Result<Option<Vec<f32>>> {
        let text = text.into();
        self.with_session(move |s| s.embed(&text)).await
    }

    pub async fn unload_all(&self) -> Result<()> {
        self.with_session(|s| {
            s.unload_all();
            Ok(())
        })
        .await
    }

    /// Request the running generation to stop. Returns immediately.
    pub fn stop_generation(&self) {
        self.stop.request();
    }

    pub async fn is_accelerator_active(&self) -> bool {
        self.session.lock().await.is_accelerator_active()
    }

    pub async fn active_backend(&self) -> Option<ComputeBackend> {
        self.session.lock().await.active_backend()
    }

    pub async fn hardware_info(&self) -> HardwareInfo {
        self.session.lock().await.hardware_info()
    }

    /// Batch size, context size and mmap recommended for this device
    pub async fn device_tuning(&self) -> DeviceTuning {
        self.session.lock().await.device_tuning()
    }

    /// Stream the reply to `prompt` piece by piece.
    ///
    /// A failed generation ends the stream with one `Err` item.
    pub fn completion_stream(&self, prompt: impl Into<String>) -> CompletionStream {
        let prompt = prompt.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::clone(&self.session);
        let stop = self.stop.clone();
        let sink_stop = stop.clone();
        let started = Arc::new(AtomicBool::new(false));
        let generation_started = Arc::clone(&started);

        let task = tokio::spawn(async move {
            let mut guard = session.lock_owned().await;
            let joined = tokio::task::spawn_blocking(move || {
                let mut sink = ChannelSink::with_stop(tx, sink_stop);
                generation_started.store(true, Ordering::SeqCst);
                if sink.is_closed() {
                    debug!("Completion stream dropped before generation started");
                    return None;
                }
                match guard.generate(&prompt, &mut sink) {
                    Ok(completion) => Some(completion),
                    Err(e) => {
                        warn!("Generation failed: {}", e);
                        sink.fail(e);
                        None
                    }
                }
            })
            .await;

            match joined {
                Ok(completion) => completion,
                Err(e) => {
                    warn!("Generation worker failed: {}", e);
                    None
                }
            }
        });

        CompletionStream {
            pieces: UnboundedReceiverStream::new(rx),
            task: Some(task),
            stop,
            started,
        }
    }
}

/// Pieces of one streamed completion
#[derive(Debug)]
pub struct CompletionStream {
    pieces: UnboundedReceiverStream<Result<String>>,
    task: Option<JoinHandle<Option<Completion>>>,
    stop: StopHandle,
    /// Set once this stream's generation holds the session
    started: Arc<AtomicBool>,
}

impl CompletionStream {
    /// Wait for the generation to end and return its summary.
    ///
    /// `None` when the generation failed; the error was delivered on the stream.
    pub async fn completion(mut self) -> Result<Option<Completion>> {
        match self.task.take() {
            Some(task) => task.await.map_err(worker_failed),
            None => Ok(None),
        }
    }
}

impl Stream for CompletionStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.pieces).poll_next(cx)
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        let Some(task) = &self.task else {
            return;
        };
        if task.is_finished() {
            return;
        }
        // A stream still queued on the lock must not stop the generation holding it
        if self.started.load(Ordering::SeqCst) {
            debug!("Completion stream dropped mid-generation, requesting stop");
            self.stop.request();
        } else {
            debug!("Completion stream dropped before its generation started");
        }
    }
}
