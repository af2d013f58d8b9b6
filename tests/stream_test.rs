//! Async engine: streamed completions, cancellation and shared access

mod support;

use futures_util::StreamExt;
use pocketllm::{EngineError, FinishReason, LlmEngine, MockRuntime};
use std::time::Duration;
use support::{model_file, session, LateStop};
use tempfile::TempDir;

async fn loaded_engine(runtime: &MockRuntime, dir: &TempDir) -> LlmEngine {
    let engine = LlmEngine::new(session(runtime));
    engine
        .load_chat_model(model_file(dir, "chat.gguf"), None, 512, 2048, true)
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn test_stream_yields_pieces_in_order() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new().script_pieces(&["one", " two", " three"]);
    let engine = loaded_engine(&runtime, &dir).await;

    let pieces: Vec<String> = engine
        .completion_stream("count")
        .map(|p| p.unwrap())
        .collect()
        .await;
    assert_eq!(pieces, vec!["one", " two", " three"]);
}

#[tokio::test]
async fn test_stop_generation_from_another_task() {
    let dir = TempDir::new().unwrap();
    let late = LateStop::default();
    let hook = late.clone();
    let pieces: Vec<String> = (0..400).map(|i| format!("p{i}")).collect();
    let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
    let runtime = MockRuntime::new().script_pieces(&refs).on_decode(move |call| {
        if call == 5 {
            hook.request();
        }
    });

    let s = session(&runtime);
    late.bind(s.stop_handle());
    let engine = LlmEngine::new(s);
    engine
        .load_chat_model(model_file(&dir, "chat.gguf"), None, 512, 2048, true)
        .await
        .unwrap();

    let mut stream = engine.completion_stream("go");
    let mut received = 0;
    while let Some(piece) = stream.next().await {
        piece.unwrap();
        received += 1;
    }
    let completion = stream.completion().await.unwrap().unwrap();
    assert_eq!(completion.finish_reason, FinishReason::Cancelled);
    assert_eq!(received, 4);
    assert_eq!(completion.n_generated, 4);
}

#[tokio::test]
async fn test_stop_generation_handle_is_lock_free() {
    let dir = TempDir::new().unwrap();
    let pieces: Vec<String> = (0..500).map(|i| format!("p{i}")).collect();
    let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
    let runtime = MockRuntime::new().script_pieces(&refs).on_decode(|_| {
        std::thread::sleep(Duration::from_millis(1));
    });
    let engine = loaded_engine(&runtime, &dir).await;

    let mut stream = engine.completion_stream("go");
    assert!(stream.next().await.is_some());
    engine.stop_generation();
    while stream.next().await.is_some() {}

    let completion = stream.completion().await.unwrap().unwrap();
    assert_eq!(completion.finish_reason, FinishReason::Cancelled);
    assert!(completion.n_generated < 500);
}

#[tokio::test]
async fn test_dropping_stream_cancels_generation() {
    let dir = TempDir::new().unwrap();
    let pieces: Vec<String> = (0..500).map(|i| format!("p{i}")).collect();
    let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
    let runtime = MockRuntime::new().script_pieces(&refs).on_decode(|_| {
        std::thread::sleep(Duration::from_millis(1));
    });
    let engine = loaded_engine(&runtime, &dir).await;

    let mut stream = engine.completion_stream("go");
    assert!(stream.next().await.is_some());
    drop(stream);

    // The session lock is released once the generation notices the stop
    engine.unload_all().await.unwrap();
    assert!(runtime.decode_calls() < 500);
    assert_eq!(runtime.live_models(), 0);
}

#[tokio::test]
async fn test_dropping_queued_stream_leaves_running_generation_alone() {
    let dir = TempDir::new().unwrap();
    let pieces: Vec<String> = (0..50).map(|i| format!("p{i}")).collect();
    let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
    let runtime = MockRuntime::new().script_pieces(&refs).on_decode(|_| {
        std::thread::sleep(Duration::from_millis(5));
    });
    let engine = loaded_engine(&runtime, &dir).await;

    let mut running = engine.completion_stream("first");
    assert_eq!(running.next().await.unwrap().unwrap(), "p0");

    // Still waiting for the session lock held by `running`
    let queued = engine.completion_stream("second");
    drop(queued);

    let mut received = 1;
    while let Some(piece) = running.next().await {
        piece.unwrap();
        received += 1;
    }
    let completion = running.completion().await.unwrap().unwrap();
    assert_eq!(completion.finish_reason, FinishReason::EndOfGeneration);
    assert_eq!(completion.n_generated, 50);
    assert_eq!(received, 50);

    // The dropped stream never generated and the lock is free again
    engine.unload_all().await.unwrap();
    assert_eq!(runtime.live_models(), 0);
}

#[tokio::test]
async fn test_stream_error_when_no_model() {
    let runtime = MockRuntime::new();
    let engine = LlmEngine::new(session(&runtime));

    let mut stream = engine.completion_stream("hello");
    assert!(matches!(
        stream.next().await,
        Some(Err(EngineError::ModelNotLoaded))
    ));
    assert!(stream.next().await.is_none());
    assert!(stream.completion().await.unwrap().is_none());
}

#[tokio::test]
async fn test_embed_and_hardware_info() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let engine = LlmEngine::new(session(&runtime));

    assert_eq!(engine.embed("text").await.unwrap(), None);
    engine
        .load_embedding_model(model_file(&dir, "embed.gguf"))
        .await
        .unwrap();
    let v = engine.embed("text").await.unwrap().unwrap();
    assert_eq!(v, vec![0.6, 0.8]);

    let info = engine.hardware_info().await;
    assert!(!info.accelerator_active);
    assert_eq!(info.backend_name, "none");
}
