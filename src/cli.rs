use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Promptbatch CLI definition.
#[derive(Debug, Parser)]
#[command(name = "promptbatch")]
#[command(
    about = "Prompt LLMs via an OpenAI-compatible API across model × template combinations",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Issue every model × prompt-variant combination and collect responses.
    Run(RunArgs),
    /// Render collected logprob records as token heatmaps.
    Visualize(VisualizeArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    #[arg(
        long,
        default_value = "data/prompts/example.jsonl",
        help = "Path to a file of JSON prompt templates"
    )]
    pub prompts: PathBuf,

    #[arg(
        long,
        required = true,
        num_args = 1..,
        help = "Model identifiers to query (space-separated)"
    )]
    pub models: Vec<String>,

    #[arg(
        long,
        help = "Output path (defaults to data/responses/<prompt-stem>_<run_id>.jsonl)"
    )]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = 0.8, help = "Sampling temperature")]
    pub temperature: f32,

    #[arg(
        long,
        default_value_t = 512,
        help = "Maximum tokens to generate per response"
    )]
    pub max_tokens: u32,

    #[arg(long, help = "Explicit run identifier; auto-generated if omitted")]
    pub run_id: Option<String>,

    #[arg(long, help = "API key (can also come from TOGETHER_API_KEY or ~/.env)")]
    pub api_key: Option<String>,

    #[arg(long, short = 'y', help = "Skip the interactive confirmation prompt")]
    pub yes: bool,

    #[arg(long, help = "Enable debug logging")]
    pub verbose: bool,
}

#[derive(Debug, Args, Clone)]
pub struct VisualizeArgs {
    #[arg(long, help = "Path to a collected response file")]
    pub input: PathBuf,

    #[arg(
        long,
        short = 'o',
        help = "Base image path; defaults to <input-stem>_heatmap.png beside the input"
    )]
    pub output: Option<PathBuf>,

    #[arg(long, help = "Enable debug logging")]
    pub verbose: bool,
}
