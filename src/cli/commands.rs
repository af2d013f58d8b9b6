use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// On-device LLM runner with automatic compute backend selection
#[derive(Parser, Debug)]
#[command(
    name = "pocketllm",
    about = "On-device LLM runner with automatic compute backend selection",
    version,
    author,
    long_about = "pocketllm loads GGUF models on the best compute backend the device can \
                  run, falling back to CPU when accelerators fail, and streams completions \
                  or computes sentence embeddings."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Show hardware classification and the backend plan",
        long_about = "Classifies the GPU vendor, checks the device denylist and prints the \
                      order in which compute backends would be attempted.\n\n\
                      Examples:\n  \
                      pocketllm probe\n  \
                      pocketllm probe --format json"
    )]
    Probe(ProbeArgs),

    #[command(
        about = "Stream a completion from a chat model",
        long_about = "Loads a chat model and streams the reply to a single prompt.\n\n\
                      Examples:\n  \
                      pocketllm generate -m qwen2.5-0.5b-q4.gguf -p \"Hello\"\n  \
                      pocketllm generate -m model.gguf -p \"Hi\" --template llama3 --ctx 4096"
    )]
    Generate(GenerateArgs),

    #[command(
        about = "Compute sentence embeddings",
        long_about = "Loads an embedding model and prints one L2-normalised vector per text. \
                      With two texts the cosine similarity is printed as well.\n\n\
                      Requires a runtime whose contexts produce embeddings. The built-in \
                      candle runtime runs quantized decoder models only and reports \
                      \"context produced no embeddings\" for every text."
    )]
    Embed(EmbedArgs),

    #[command(about = "Forget recorded backend failures")]
    ResetBackends,
}

#[derive(Parser, Debug, Clone)]
pub struct ProbeArgs {
    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(short = 'm', long, value_name = "FILE", help = "Path to the GGUF chat model")]
    pub model: PathBuf,

    #[arg(short = 'p', long, value_name = "TEXT", help = "User prompt")]
    pub prompt: String,

    #[arg(
        short = 't',
        long,
        value_name = "TEMPLATE",
        help = "Chat template overriding the one embedded in the model"
    )]
    pub template: Option<String>,

    #[arg(long, value_name = "N", help = "Batch size (device-tuned when omitted)")]
    pub batch: Option<u32>,

    #[arg(long, value_name = "N", help = "Context size (device-tuned when omitted)")]
    pub ctx: Option<u32>,

    #[arg(long, help = "Read the model into memory instead of mapping it")]
    pub no_mmap: bool,

    #[arg(long, value_name = "N", help = "Maximum number of tokens to generate")]
    pub max_tokens: Option<usize>,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Summary format")]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct EmbedArgs {
    #[arg(short = 'm', long, value_name = "FILE", help = "Path to the GGUF embedding model")]
    pub model: PathBuf,

    #[arg(value_name = "TEXT", required = true, help = "Texts to embed")]
    pub texts: Vec<String>,

    #[arg(short = 'f', long, value_enum, default_value = "json", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}
