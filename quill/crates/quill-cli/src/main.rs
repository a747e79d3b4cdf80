use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use quill::backend::{OpenAiCompatibleBackend, StubBackend, TokenUsage};
use quill::config::EngineConfig;
use quill::ledger::{estimate_tokens, UsageEntry};
use quill::settings::{self, GenerationSettings};
use quill::store::SqliteStore;
use quill::{
    stream_tags, GenerationBackend, JobCallbacks, JobController, JobDescriptor, JobOutcome,
    JobType, KeyValueStore, UsageLedger,
};
use tracing_subscriber::EnvFilter;

/// Run writing-feedback jobs against a text-generation backend.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/quill/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job and print its normalized result as JSON.
    Run {
        /// Job type: logic-check, grammar-check, scoring, letter-logic, letter-scoring.
        #[arg(long = "type")]
        job_type: JobType,

        /// File holding the prompt text.
        #[arg(long)]
        prompt_file: PathBuf,

        /// Correlation id; a random one is generated when omitted.
        #[arg(long)]
        id: Option<String>,

        /// Replay this file instead of calling the configured backend.
        #[arg(long)]
        stub: Option<PathBuf>,

        /// Print the parsed payload without normalizing it.
        #[arg(long)]
        raw: bool,
    },
    /// Show usage for today, this month and a daily trend.
    Usage {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Show or change usage limits.
    Limits {
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[arg(long)]
        daily_tokens: Option<u64>,
        #[arg(long)]
        monthly_tokens: Option<u64>,
        #[arg(long)]
        daily_cost: Option<f64>,
        #[arg(long)]
        monthly_cost: Option<f64>,
    },
    /// Show or change persisted generation settings.
    Settings {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Delete all recorded usage. Limits are kept.
    ClearUsage,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quill=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    let db_path = config.database_path();
    let store: Arc<dyn KeyValueStore> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("failed to open store at {}", db_path.display()))?,
    );
    let ledger = UsageLedger::new(Some(store.clone()), config.price_table()?);

    match cli.command {
        Command::Run {
            job_type,
            prompt_file,
            id,
            stub,
            raw,
        } => run(&config, store, &ledger, job_type, prompt_file, id, stub, raw),
        Command::Usage { days } => {
            show_usage(&ledger, days);
            Ok(())
        }
        Command::Limits {
            enable,
            disable,
            daily_tokens,
            monthly_tokens,
            daily_cost,
            monthly_cost,
        } => {
            let mut limits = ledger.limits();
            let before = limits.clone();
            if enable {
                limits.enabled = true;
            }
            if disable {
                limits.enabled = false;
            }
            limits.daily_tokens = daily_tokens.unwrap_or(limits.daily_tokens);
            limits.monthly_tokens = monthly_tokens.unwrap_or(limits.monthly_tokens);
            limits.daily_cost = daily_cost.unwrap_or(limits.daily_cost);
            limits.monthly_cost = monthly_cost.unwrap_or(limits.monthly_cost);
            if limits != before {
                ledger.set_limits(&limits);
            }
            println!("{}", serde_json::to_string_pretty(&limits)?);
            Ok(())
        }
        Command::Settings {
            model,
            temperature,
            max_tokens,
        } => {
            let mut current = settings::load(Some(store.as_ref()));
            let before = current.clone();
            if let Some(model) = model {
                current.model = Some(model).filter(|m| !m.trim().is_empty());
            }
            current.temperature = temperature.unwrap_or(current.temperature);
            current.max_tokens = max_tokens.unwrap_or(current.max_tokens);
            if current != before {
                settings::save(Some(store.as_ref()), &current);
            }
            println!("{}", serde_json::to_string_pretty(&current)?);
            Ok(())
        }
        Command::ClearUsage => {
            ledger.clear_usage_data();
            println!("Usage data cleared");
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    config: &EngineConfig,
    store: Arc<dyn KeyValueStore>,
    ledger: &UsageLedger,
    job_type: JobType,
    prompt_file: PathBuf,
    id: Option<String>,
    stub: Option<PathBuf>,
    raw: bool,
) -> Result<()> {
    let check = ledger.check_limits();
    if !check.allowed {
        for violation in &check.violations {
            eprintln!("{}", violation.red());
        }
        bail!("usage limit reached, not starting {job_type} job");
    }

    let prompt = fs::read_to_string(&prompt_file)
        .with_context(|| format!("failed to read prompt: {}", prompt_file.display()))?;
    let generation: GenerationSettings = settings::load(Some(store.as_ref()));
    let model = generation
        .model
        .clone()
        .unwrap_or_else(|| config.model.clone());

    let backend: Arc<dyn GenerationBackend> = match stub {
        Some(path) => {
            let response = fs::read_to_string(&path)
                .with_context(|| format!("failed to read stub response: {}", path.display()))?;
            Arc::new(StubBackend::new(response))
        }
        None => {
            if config.api_key().is_none() {
                bail!("no API key: set {}", config.api_key_env);
            }
            Arc::new(OpenAiCompatibleBackend::from_config(config))
        }
    };

    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut descriptor = JobDescriptor::new(
        job_type,
        id,
        stream_tags::with_payload_instruction(&prompt),
    )
    .settings(generation);
    if raw {
        descriptor = descriptor.without_normalizer();
    }

    let controller = JobController::new(backend);
    let mut printed = String::new();
    let callbacks = JobCallbacks::new()
        .on_start(|| eprintln!("{} {job_type}", "Running".cyan().bold()))
        .on_progress(move |streaming| {
            eprint!("{}", preview_update(&printed, &streaming.text));
            let _ = std::io::stderr().flush();
            printed.clone_from(&streaming.text);
        });

    let Some(outcome) = controller.run_job(descriptor.clone(), callbacks) else {
        bail!("job did not start");
    };
    eprintln!();

    let record = |raw: &str, usage: Option<TokenUsage>| {
        let (input, output) = match usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (estimate_tokens(&descriptor.prompt), estimate_tokens(raw)),
        };
        let cost = ledger.record_usage(input, output, &model);
        tracing::info!(input, output, cost, "usage recorded");
    };
    match outcome {
        JobOutcome::Completed(success) => {
            record(&success.raw, success.usage);
            println!("{}", serde_json::to_string_pretty(&success.json)?);
            Ok(())
        }
        JobOutcome::Rejected(rejection) => {
            record(&rejection.raw, rejection.usage);
            println!("{}", serde_json::to_string_pretty(&rejection.json)?);
            bail!("{}", rejection.error.message);
        }
        JobOutcome::Failed(failure) => {
            // The provider bills a stream that completed, usable or not.
            if let Some(raw) = &failure.raw {
                record(raw, failure.usage);
            }
            if let Some(partial) = &failure.error.partial_text {
                tracing::debug!(chars = partial.len(), "stream ended early");
            }
            bail!("{}", failure.error.message);
        }
    }
}

/// What to write to the terminal to move from `printed` to `text`: the new
/// tail when `text` extends it, otherwise a fresh line with all of `text`.
fn preview_update(printed: &str, text: &str) -> String {
    match text.strip_prefix(printed) {
        Some(tail) => tail.to_string(),
        None => format!("\n{text}"),
    }
}

fn show_usage(ledger: &UsageLedger, days: u32) {
    let summary = ledger.summary();
    let line = |label: &str, entry: &UsageEntry| {
        println!(
            "{:<8} {:>10} tokens  {:>6} requests  ${:.4}",
            label.bold(),
            entry.total_tokens(),
            entry.request_count,
            entry.cost
        );
    };
    line("Today", &summary.today);
    line("Month", &summary.month);
    line("Total", &summary.total);

    if days > 0 {
        println!();
        for day in ledger.usage_trend(days) {
            println!(
                "{}  {:>10} tokens  ${:.4}",
                day.date,
                day.usage.total_tokens(),
                day.usage.cost
            );
        }
    }

    let check = ledger.check_limits();
    for violation in &check.violations {
        println!("{}", violation.yellow());
    }
}
