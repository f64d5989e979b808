//! # opsight CLI
//!
//! ## Usage
//!
//! ```bash
//! opsight --config ./config/opsight.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `opsight window` | Resolve and validate a time window |
//! | `opsight context "<query>"` | Assemble logs, metrics, events, and correlations as JSON |
//! | `opsight retrieve "<query>"` | Vector-retrieve relevant logs and metrics as JSON |
//! | `opsight analyze "<query>"` | Build an enriched prompt and ask the LLM |
//!
//! ## Examples
//!
//! ```bash
//! opsight window --last 2h
//! opsight context "cpu spike" --last 1h --types logs,metrics
//! opsight retrieve "disk full" --k 10 --min-relevance 0.6
//! opsight analyze "why did the api restart?" --last 6h
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use opsight::chroma::ChromaIndex;
use opsight::config::{self, Config, LoggingConfig};
use opsight::context_manager::{ContextManager, ContextManagerConfig};
use opsight::context_processor::{ContextProcessor, RetrieveRequest};
use opsight::embedding::create_embedder;
use opsight::llm::{Completion, OllamaCompletion};
use opsight::log_source::LokiClient;
use opsight::prompt::{enhance_prompt, render_analysis_context};
use opsight_core::embedding::Embedder;
use opsight_core::models::ContextType;
use opsight_core::retrieval::{LogRetriever, MetricRetriever, Retriever};
use opsight_core::time_window::{self, TimeWindowResolver};
use tracing_subscriber::prelude::*;

const DEFAULT_CONFIG_PATH: &str = "./config/opsight.toml";

const DEFAULT_BASE_PROMPT: &str =
    "You are a site reliability engineer investigating an operational issue.";

/// opsight: context retrieval and correlation for log and metric analysis.
#[derive(Parser)]
#[command(name = "opsight", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/opsight.toml`; built-in defaults are used when
    /// that file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a time window and print it in every backend format.
    Window {
        /// Window length ending at `--end` (or now): 90s, 15m, 2h, 7d, 1w.
        #[arg(long, value_parser = time_window::parse_duration)]
        last: Option<Duration>,

        /// Explicit start (RFC 3339). Takes precedence over `--last`.
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<DateTime<Utc>>,

        /// Explicit end (RFC 3339). Defaults to now.
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<DateTime<Utc>>,
    },

    /// Assemble the analysis context for a query and print it as JSON.
    Context {
        query: String,

        #[arg(long, value_parser = time_window::parse_duration)]
        last: Option<Duration>,

        /// Comma-separated subset of logs, metrics, events.
        #[arg(long, value_delimiter = ',')]
        types: Option<Vec<ContextType>>,

        /// Skip the correlation engine.
        #[arg(long)]
        no_correlations: bool,

        /// Give up (and print the empty context) after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Retrieve semantically similar logs and metrics and print them as JSON.
    Retrieve {
        query: String,

        #[arg(long, value_parser = time_window::parse_duration)]
        last: Option<Duration>,

        /// Maximum log items (metrics get half).
        #[arg(long)]
        k: Option<usize>,

        #[arg(long)]
        min_relevance: Option<f64>,

        #[arg(long)]
        no_metrics: bool,
    },

    /// Build an enriched prompt from both contexts and print the LLM's answer.
    Analyze {
        query: String,

        #[arg(long, value_parser = time_window::parse_duration)]
        last: Option<Duration>,

        /// Base instructions placed before the analysis checklist.
        #[arg(long)]
        prompt: Option<String>,

        /// Print the prompt instead of sending it.
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    time_window::parse_timestamp(s).ok_or_else(|| format!("invalid timestamp '{}'", s))
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG_PATH))
        }
        None => Ok(Config::default()),
    }
}

fn init_logging(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    if cfg.json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    }
}

fn vector_timeout(cfg: &Config) -> StdDuration {
    StdDuration::from_secs(cfg.embedding.timeout_secs)
}

fn metric_retriever(cfg: &Config, embedder: Arc<dyn Embedder>) -> Result<Arc<dyn Retriever>> {
    let index = ChromaIndex::new(
        &cfg.vector.url,
        cfg.vector.metrics_collection.clone(),
        "System metrics and measurements",
        vector_timeout(cfg),
    )?;
    Ok(Arc::new(MetricRetriever::new(Arc::new(index), embedder)))
}

fn build_context_manager(cfg: &Config) -> Result<ContextManager> {
    let loki = LokiClient::new(&cfg.log_source).context("Failed to create Loki client")?;
    let manager = ContextManager::new(
        Arc::new(loki),
        ContextManagerConfig::from_config(&cfg.context, &cfg.retrieval),
    );

    if cfg.vector.enabled && cfg.embedding.is_enabled() {
        let embedder = create_embedder(&cfg.embedding)?;
        Ok(manager.with_metric_retriever(metric_retriever(cfg, embedder)?))
    } else {
        Ok(manager)
    }
}

fn build_processor(cfg: &Config) -> Result<ContextProcessor> {
    if !cfg.vector.enabled {
        anyhow::bail!("vector.enabled is false; retrieval needs a vector store");
    }
    let embedder = create_embedder(&cfg.embedding)?;
    let logs = ChromaIndex::new(
        &cfg.vector.url,
        cfg.vector.logs_collection.clone(),
        "System logs and events",
        vector_timeout(cfg),
    )?;
    Ok(ContextProcessor::new(
        embedder.clone(),
        Arc::new(LogRetriever::new(Arc::new(logs), embedder.clone())),
        Some(metric_retriever(cfg, embedder)?),
        StdDuration::from_secs(cfg.context.cache_ttl_secs),
        cfg.context.cache_max_size,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load(cli.config.as_deref())?;
    init_logging(&cfg.logging);

    let default_window = Duration::seconds(cfg.context.default_window_secs as i64);

    match cli.command {
        Commands::Window { last, start, end } => {
            let resolver = TimeWindowResolver::new(default_window);
            let (start, end) = resolver
                .resolve(last, start, end)
                .context("Invalid time window")?;
            let window = resolver
                .check(start, end)
                .with_context(|| format!("Invalid time window {} .. {}", start, end))?;
            let (start_secs, end_secs) = window.to_epoch_seconds();
            let (start_ns, end_ns) = window.to_nanos();
            println!("start:   {}", window.start().to_rfc3339());
            println!("end:     {}", window.end().to_rfc3339());
            println!("label:   {}", window.human_label());
            println!("seconds: {} {}", start_secs, end_secs);
            println!("nanos:   {} {}", start_ns, end_ns);
        }
        Commands::Context {
            query,
            last,
            types,
            no_correlations,
            timeout,
        } => {
            let manager = build_context_manager(&cfg)?;
            let types = types.as_deref();
            let doc = match timeout {
                Some(secs) => {
                    manager
                        .get_analysis_context_within(
                            StdDuration::from_secs(secs),
                            &query,
                            last,
                            types,
                            !no_correlations,
                        )
                        .await
                }
                None => {
                    manager
                        .get_analysis_context(&query, last, types, !no_correlations)
                        .await
                }
            };
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Retrieve {
            query,
            last,
            k,
            min_relevance,
            no_metrics,
        } => {
            let processor = build_processor(&cfg)?;
            let request = RetrieveRequest {
                time_window: last,
                k: k.unwrap_or(cfg.retrieval.k),
                min_relevance: min_relevance.unwrap_or(cfg.retrieval.min_relevance),
                include_metrics: !no_metrics,
            };
            let ctx = processor.retrieve_context(&query, &request).await;
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }
        Commands::Analyze {
            query,
            last,
            prompt,
            dry_run,
        } => {
            let manager = build_context_manager(&cfg)?;
            let processor = build_processor(&cfg)?;
            let request = RetrieveRequest {
                time_window: last,
                k: cfg.retrieval.k,
                min_relevance: cfg.retrieval.min_relevance,
                include_metrics: true,
            };

            let (doc, retrieved) = tokio::join!(
                manager.get_analysis_context(&query, last, None, true),
                processor.retrieve_context(&query, &request),
            );

            let base = format!(
                "{}\n\nObserved context:\n{}",
                prompt.as_deref().unwrap_or(DEFAULT_BASE_PROMPT),
                render_analysis_context(&doc)
            );
            let full_prompt = enhance_prompt(&query, &base, &retrieved);

            if dry_run {
                println!("{}", full_prompt);
                return Ok(());
            }

            let llm = OllamaCompletion::new(&cfg.llm)?;
            let answer = llm
                .complete(&full_prompt, StdDuration::from_secs(cfg.llm.timeout_secs))
                .await?;
            println!("{}", answer);
        }
    }

    Ok(())
}
