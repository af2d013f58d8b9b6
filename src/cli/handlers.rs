//! Subcommand implementations. Each returns the process exit code.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use super::commands::{EmbedArgs, GenerateArgs, ProbeArgs};
use super::output::{CompletionSummary, EmbeddingReport, OutputFormatter, ProbeReport};
use crate::backend::{BackendHistory, BackendSelector};
use crate::config::EngineConfig;
use crate::engine::{cosine_similarity, LlmEngine};
use crate::hardware::{is_opencl_library_present, BackendPolicy, DeviceTuning, HardwareProbe};
use crate::runtime::candle::CandleLoader;
use crate::session::Session;

fn report_failure(e: &anyhow::Error) -> i32 {
    error!("{:#}", e);
    eprintln!("Error: {:#}", e);
    1
}

fn build_engine(config: EngineConfig) -> Result<LlmEngine> {
    let session = Session::new(Arc::new(CandleLoader::new()), config)
        .context("Failed to create inference session")?;
    debug!("{:?}", session);
    Ok(LlmEngine::new(session))
}

pub fn handle_probe(args: &ProbeArgs) -> i32 {
    match run_probe(args) {
        Ok(()) => 0,
        Err(e) => report_failure(&e),
    }
}

fn run_probe(args: &ProbeArgs) -> Result<()> {
    let config = EngineConfig::default();
    config.validate().context("Invalid configuration")?;

    let selector = BackendSelector::new(
        HardwareProbe::system(),
        BackendPolicy::load_or_default(config.backend_policy.as_deref()),
        BackendHistory::open_or_in_memory(config.history_path().as_deref()),
    );
    let (profile, plan) = selector.plan();
    let tuning = DeviceTuning::detect(&profile);
    let history = selector.history();

    let report = ProbeReport::new(
        profile,
        &plan,
        tuning,
        is_opencl_library_present(),
        history.failed().iter().copied().collect(),
        history.last_success(),
    );

    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_probe(&report)?);
    Ok(())
}

pub async fn handle_generate(args: &GenerateArgs, quiet: bool) -> i32 {
    match run_generate(args, quiet).await {
        Ok(()) => 0,
        Err(e) => report_failure(&e),
    }
}

async fn run_generate(args: &GenerateArgs, quiet: bool) -> Result<()> {
    let mut config = EngineConfig::default();
    if let Some(max) = args.max_tokens {
        config.max_new_tokens = max;
    }
    let engine = build_engine(config)?;

    let started = Instant::now();
    let loaded = match (args.batch, args.ctx) {
        (None, None) if !args.no_mmap => {
            engine
                .load_chat_model_tuned(&args.model, args.template.clone())
                .await
        }
        _ => {
            let tuning = engine.device_tuning().await;
            engine
                .load_chat_model(
                    &args.model,
                    args.template.clone(),
                    args.batch.unwrap_or(tuning.batch_size),
                    args.ctx.unwrap_or(tuning.context_size),
                    !args.no_mmap && tuning.use_mmap,
                )
                .await
        }
    };
    loaded.with_context(|| format!("Failed to load chat model {}", args.model.display()))?;

    let info = engine.hardware_info().await;
    debug!(backend = %info.backend_name, "Model ready in {:?}", started.elapsed());

    let stop = engine.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop_generation();
        }
    });

    let started = Instant::now();
    let mut stream = engine.completion_stream(args.prompt.as_str());
    let mut stdout = std::io::stdout();
    while let Some(piece) = stream.next().await {
        let piece = piece.context("Generation failed")?;
        write!(stdout, "{}", piece)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    ctrl_c.abort();

    let completion = stream.completion().await?;
    if let Some(completion) = completion {
        if !quiet {
            let summary = CompletionSummary::new(
                &completion,
                engine.active_backend().await,
                started.elapsed().as_millis(),
            );
            let formatter = OutputFormatter::new(args.format.into());
            eprintln!("{}", formatter.format_summary(&summary)?);
        }
    }

    engine.unload_all().await?;
    Ok(())
}

pub async fn handle_embed(args: &EmbedArgs) -> i32 {
    match run_embed(args).await {
        Ok(()) => 0,
        Err(e) => report_failure(&e),
    }
}

async fn run_embed(args: &EmbedArgs) -> Result<()> {
    let engine = build_engine(EngineConfig::default())?;
    engine
        .load_embedding_model(&args.model)
        .await
        .with_context(|| format!("Failed to load embedding model {}", args.model.display()))?;

    let mut reports = Vec::with_capacity(args.texts.len());
    for text in &args.texts {
        let vector = engine
            .embed(text.as_str())
            .await
            .with_context(|| format!("Failed to embed {:?}", text))?
            .unwrap_or_default();
        reports.push(EmbeddingReport {
            text: text.clone(),
            dimensions: vector.len(),
            vector,
        });
    }

    let similarity = match reports.as_slice() {
        [a, b] => Some(cosine_similarity(&a.vector, &b.vector)),
        _ => None,
    };

    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_embeddings(&reports, similarity)?);

    engine.unload_all().await?;
    Ok(())
}

pub fn handle_reset_backends() -> i32 {
    let config = EngineConfig::default();
    match config.history_path() {
        Some(path) => {
            let mut history = BackendHistory::open_or_in_memory(Some(&path));
            history.clear_failures();
            println!("Cleared backend failures in {}", path.display());
            0
        }
        None => {
            println!("Backend history is disabled, nothing to reset");
            0
        }
    }
}
