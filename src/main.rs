use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use uuid::Uuid;

use promptbatch::{
    cli::{Cli, Commands, RunArgs, VisualizeArgs},
    client::{API_KEY_ENV, GenerationParams, TogetherClient},
    collector::ResponseCollector,
    logging,
    paths::{home_env_path, responses_dir},
    prompts::{self, PromptTemplate, load_templates},
    record::read_records,
    runner::Runner,
    viz,
};

static ENV_FILES_ONCE: OnceLock<()> = OnceLock::new();

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Visualize(args) => visualize_command(args),
    }
}

async fn run_command(args: RunArgs) -> Result<()> {
    let run_id = args.run_id.clone().unwrap_or_else(new_run_id);
    let _guard = logging::init(args.verbose, Some(&run_id));

    let templates = load_templates(&args.prompts)?;
    if templates.is_empty() {
        bail!(
            "No prompt templates found in {} — check the file contents",
            args.prompts.display()
        );
    }

    let registry = prompts::registry();
    let mut variant_count = 0usize;
    for template in &templates {
        variant_count += template.expand(&registry)?.len();
    }
    let total = variant_count * args.models.len();
    let output_path = resolve_output_path(&args, &run_id, &templates);

    println!("  Prompt file : {}", args.prompts.display());
    println!("  Models      : {}", args.models.len());
    println!(
        "  Variants    : {variant_count}  ({} template(s), expanded across variables)",
        templates.len()
    );
    println!("  Total calls : {total}");
    println!("  Output      : {}", output_path.display());
    println!();

    if !args.yes && !confirm("Proceed? [y/N] ")? {
        println!("Aborted.");
        return Ok(());
    }

    let api_key = resolve_api_key(args.api_key.clone())?;
    let client = Arc::new(TogetherClient::new(api_key)?);
    let params = GenerationParams {
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        logprobs: None,
    };

    let mut collector = ResponseCollector::create(&output_path)?;
    let runner = Runner::new(client, args.models.clone(), params, run_id);
    runner.run(&templates, &mut collector).await?;

    println!("\nDone. Responses written to: {}", output_path.display());
    Ok(())
}

fn visualize_command(args: VisualizeArgs) -> Result<()> {
    let _guard = logging::init(args.verbose, None);

    let records = read_records(&args.input)?;
    if records.is_empty() {
        bail!("No records found in {}", args.input.display());
    }

    let base = args
        .output
        .clone()
        .unwrap_or_else(|| default_viz_output(&args.input));
    let written = viz::render(&records, &base)?;
    for path in &written {
        println!("Saved: {}", path.display());
    }
    Ok(())
}

fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Default output layout recovered from the response directory convention:
/// `data/responses/<prompt-stem>[_logprobs]_<run_id>.jsonl`.
fn resolve_output_path(args: &RunArgs, run_id: &str, templates: &[PromptTemplate]) -> PathBuf {
    if let Some(output) = &args.output {
        return output.clone();
    }
    let stem = args
        .prompts
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "prompts".to_string());
    let uses_logprobs = templates.iter().any(|template| template.logprobs.is_some());
    let file_name = if uses_logprobs {
        format!("{stem}_logprobs_{run_id}.jsonl")
    } else {
        format!("{stem}_{run_id}.jsonl")
    };
    responses_dir().join(file_name)
}

fn default_viz_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "responses".to_string());
    input.with_file_name(format!("{stem}_heatmap.png"))
}

/// Prompts on stdout and reads one line; EOF or a non-`y` answer declines.
fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        println!();
        return Ok(false);
    }
    Ok(line.trim().eq_ignore_ascii_case("y"))
}

fn resolve_api_key(cli_value: Option<String>) -> Result<String> {
    ensure_env_files_loaded();
    let env_value = std::env::var(API_KEY_ENV).ok();
    pick_api_key(cli_value, env_value)
        .map_err(|_| anyhow!("Missing API key: pass --api-key or set {API_KEY_ENV}"))
}

fn pick_api_key(cli_value: Option<String>, env_value: Option<String>) -> Result<String> {
    if let Some(key) = normalize_key(cli_value) {
        return Ok(key);
    }
    if let Some(key) = normalize_key(env_value) {
        return Ok(key);
    }

    Err(anyhow!("Missing API key"))
}

fn normalize_key(value: Option<String>) -> Option<String> {
    value.and_then(|candidate| {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Loads `.env` from the working directory, then from the home directory.
/// Variables already present in the process environment always win.
fn ensure_env_files_loaded() {
    ENV_FILES_ONCE.get_or_init(|| {
        let mut candidates = vec![PathBuf::from(".env")];
        if let Some(path) = home_env_path() {
            candidates.push(path);
        }
        for path in candidates {
            if let Ok(contents) = fs::read_to_string(&path) {
                apply_env_contents(&contents);
            }
        }
    });
}

fn apply_env_contents(contents: &str) {
    for line in contents.lines() {
        if let Some((key, value)) = parse_env_assignment(line)
            && std::env::var_os(&key).is_none()
        {
            unsafe {
                std::env::set_var(&key, &value);
            }
        }
    }
}

fn parse_env_assignment(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed).trim();

    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let value = normalize_env_value(value.trim());
    Some((key.to_string(), value))
}

fn normalize_env_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2
        && ((trimmed.starts_with('\"') && trimmed.ends_with('\"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    trimmed.to_string()
}
