//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use corpus_core::pipeline::{PipelineDeps, ProgressReporter};
use corpus_discovery::providers_from_config;
use corpus_llm::{ModelBackend, OpenRouterBackend};
use corpus_shared::{
    AppConfig, PipelineConfig, PipelineResult, init_config, load_config, read_api_key,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// corpus: research question in, cleaned sources out.
#[derive(Parser)]
#[command(
    name = "corpus",
    version,
    about = "Gather, filter, and clean web sources for a research question.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the research pipeline for a question.
    Research {
        /// The research question.
        query: String,

        /// Write the full result as JSON to this file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Number of candidates to fetch.
        #[arg(short, long)]
        target: Option<usize>,

        /// Initial relevance threshold in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,

        /// Stop scheduling new work after this many seconds.
        #[arg(long)]
        deadline: Option<u64>,

        /// Skip the language model: heuristic expansion, no cleaning.
        #[arg(long)]
        no_model: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "corpus=info",
        1 => "corpus=debug",
        _ => "corpus=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so stdout stays clean for the JSON result.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Flags that override values from the config file.
#[derive(Debug, Default)]
struct Overrides {
    target: Option<usize>,
    threshold: Option<f64>,
    deadline: Option<u64>,
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Research {
            query,
            out,
            target,
            threshold,
            deadline,
            no_model,
        } => {
            let overrides = Overrides {
                target,
                threshold,
                deadline,
            };
            cmd_research(&query, out.as_deref(), &overrides, no_model).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn pipeline_config(config: &AppConfig, overrides: &Overrides) -> PipelineConfig {
    let mut pipeline = PipelineConfig::from(config);
    if let Some(k) = overrides.target {
        pipeline.target_candidate_count = k;
    }
    if let Some(t) = overrides.threshold {
        pipeline.relevance_threshold = t;
    }
    if let Some(secs) = overrides.deadline {
        pipeline.run_deadline = Some(Duration::from_secs(secs));
    }
    pipeline
}

/// Build the OpenRouter backend, or `None` when the key is missing.
fn model_backend(config: &AppConfig, timeout: Duration) -> Result<Option<Arc<dyn ModelBackend>>> {
    let key = match read_api_key(&config.openrouter.api_key_env) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "no model backend, continuing without expansion model or cleaning");
            return Ok(None);
        }
    };
    let backend = OpenRouterBackend::new(
        key,
        &config.openrouter.base_url,
        &config.openrouter.default_model,
        timeout,
    )
    .map_err(|e| eyre!("cannot create model backend: {e}"))?;
    Ok(Some(Arc::new(backend)))
}

async fn cmd_research(
    query: &str,
    out: Option<&Path>,
    overrides: &Overrides,
    no_model: bool,
) -> Result<()> {
    let config = load_config()?;
    let pipeline = pipeline_config(&config, overrides);
    pipeline.validate()?;

    let model = if no_model {
        None
    } else {
        model_backend(&config, pipeline.per_call_timeout)?
    };
    let (providers, setup_errors) = providers_from_config(&config, pipeline.per_call_timeout);
    if providers.is_empty() {
        return Err(eyre!(
            "no search provider is usable: {}",
            setup_errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }

    let deps = PipelineDeps {
        model,
        providers,
        provider_setup_errors: setup_errors.iter().map(ToString::to_string).collect(),
        domain_cache: None,
    };

    info!(
        query,
        target = pipeline.target_candidate_count,
        providers = deps.providers.len(),
        model = deps.model.as_ref().map(|m| m.name().to_string()),
        "starting research"
    );

    let reporter = CliProgress::new()?;
    let result = corpus_core::pipeline::run(query, &pipeline, &deps, &reporter).await?;

    let json = serde_json::to_string_pretty(&result)?;
    match out {
        Some(path) => {
            std::fs::write(path, json)
                .map_err(|e| eyre!("cannot write '{}': {e}", path.display()))?;
            print_summary(&result);
            println!("  Output:     {}", path.display());
            println!();
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn print_summary(result: &PipelineResult) {
    println!();
    if result.partial_failure {
        println!("  Research finished with problems.");
    } else {
        println!("  Research finished.");
    }
    println!("  Run:        {}", result.run_id);
    println!("  Sub-queries: {}", result.expansion_set.sub_queries.join(" | "));
    println!("  Discovered: {}", result.total_candidates_discovered);
    println!("  Fetched:    {}", result.total_selected_for_acquisition - result.stats.fetch_failed);
    println!("  Filtered:   {}", result.stats.garbage_filtered);
    println!("  Cleaned:    {}", result.total_cleaned);
    println!(
        "  Model:      {} calls, {} tokens in, {} out",
        result.stats.model_calls, result.stats.tokens_in, result.stats.tokens_out
    );
    println!("  Time:       {:.1}s", result.processing_time.as_secs_f64());
    for e in &result.errors {
        println!("  ! {e}");
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Result<Self> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Ok(Self { spinner })
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn phase_done(&self, name: &str, summary: &str) {
        self.spinner.println(format!("  {name}: {summary}"));
    }

    fn done(&self, _result: &PipelineResult) {
        self.spinner.finish_and_clear();
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn research_flags_parse() {
        let cli = Cli::try_parse_from([
            "corpus",
            "-vv",
            "research",
            "latest wind energy developments",
            "--target",
            "5",
            "--threshold",
            "0.6",
            "--no-model",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Research {
                query,
                target,
                threshold,
                no_model,
                out,
                ..
            } => {
                assert_eq!(query, "latest wind energy developments");
                assert_eq!(target, Some(5));
                assert_eq!(threshold, Some(0.6));
                assert!(no_model);
                assert!(out.is_none());
            }
            Command::Config { .. } => panic!("expected research command"),
        }
    }

    #[test]
    fn flags_override_config() {
        let overrides = Overrides {
            target: Some(3),
            threshold: Some(0.7),
            deadline: Some(60),
        };
        let pipeline = pipeline_config(&AppConfig::default(), &overrides);
        assert_eq!(pipeline.target_candidate_count, 3);
        assert_eq!(pipeline.relevance_threshold, 0.7);
        assert_eq!(pipeline.run_deadline, Some(Duration::from_secs(60)));

        let untouched = pipeline_config(&AppConfig::default(), &Overrides::default());
        assert_eq!(untouched.target_candidate_count, 10);
        assert!(untouched.run_deadline.is_none());
    }
}
