use pocketllm::cli::commands::{CliArgs, Commands};
use pocketllm::cli::handlers::{handle_embed, handle_generate, handle_probe, handle_reset_backends};
use pocketllm::util::logging::{self, parse_level, LoggingConfig};
use pocketllm::VERSION;

use clap::Parser;
use std::env;
use tracing::{debug, Level};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("pocketllm v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Probe(probe_args) => handle_probe(probe_args),
        Commands::Generate(generate_args) => handle_generate(generate_args, args.quiet).await,
        Commands::Embed(embed_args) => handle_embed(embed_args).await,
        Commands::ResetBackends => handle_reset_backends(),
    };

    std::process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs) {
    let level = if let Some(level_str) = &args.log_level {
        parse_level(level_str)
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        env::var("POCKETLLM_LOG_LEVEL")
            .map(|v| parse_level(&v))
            .unwrap_or(Level::WARN)
    };

    let use_json = env::var("POCKETLLM_LOG_JSON")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);

    logging::init_logging(LoggingConfig {
        level,
        use_json,
        ..LoggingConfig::default()
    });
}
