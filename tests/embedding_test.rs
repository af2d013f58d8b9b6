//! Embeddings through a session

mod support;

use pocketllm::engine::cosine_similarity;
use pocketllm::{EngineError, MockRuntime};
use support::{chat_session, model_file, session};
use tempfile::TempDir;

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[test]
fn test_embedding_is_unit_length() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new().embedding(vec![1.0, 2.0, 2.0, 4.0]);
    let mut s = session(&runtime);
    s.load_embedding(&model_file(&dir, "embed.gguf")).unwrap();

    let v = s.embed("The quick brown fox").unwrap().unwrap();
    assert_eq!(v.len(), 4);
    assert!((norm(&v) - 1.0).abs() < 1e-5);
    assert!((cosine_similarity(&v, &[1.0, 2.0, 2.0, 4.0]) - 1.0).abs() < 1e-5);
}

#[test]
fn test_empty_text_yields_empty_vector() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let mut s = session(&runtime);
    s.load_embedding(&model_file(&dir, "embed.gguf")).unwrap();

    assert_eq!(s.embed("").unwrap(), Some(vec![]));
    assert_eq!(runtime.decode_calls(), 0);
}

#[test]
fn test_no_model_yields_none() {
    let runtime = MockRuntime::new();
    let mut s = session(&runtime);
    assert_eq!(s.embed("anything").unwrap(), None);
}

#[test]
fn test_repeated_embeddings_are_stable() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let mut s = session(&runtime);
    s.load_embedding(&model_file(&dir, "embed.gguf")).unwrap();

    let first = s.embed("same text").unwrap();
    let second = s.embed("same text").unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_chat_context_without_embeddings_errors() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let mut s = chat_session(&runtime, &dir);

    // The chat context is created without embedding output
    assert!(matches!(s.embed("hello"), Err(EngineError::Embedding(_))));
    assert!(s.has_chat_model());
}

#[test]
fn test_embedding_model_preferred_over_chat() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new().embedding(vec![0.0, 5.0]);
    let mut s = chat_session(&runtime, &dir);
    s.load_embedding(&model_file(&dir, "embed.gguf")).unwrap();

    assert_eq!(s.embed("hello").unwrap(), Some(vec![0.0, 1.0]));
}

#[test]
fn test_embedding_after_generation_does_not_disturb_chat() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new().script_pieces(&["hi"]);
    let mut s = chat_session(&runtime, &dir);
    s.load_embedding(&model_file(&dir, "embed.gguf")).unwrap();

    let mut sink = |_: &str| {};
    assert_eq!(s.generate("one", &mut sink).unwrap().text, "hi");
    s.embed("between").unwrap();
    assert_eq!(s.generate("two", &mut sink).unwrap().text, "hi");
}
