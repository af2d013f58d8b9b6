pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::{CliArgs, Commands, EmbedArgs, GenerateArgs, ProbeArgs};
pub use output::{OutputFormat, OutputFormatter};
