//! # Message QA CLI (`mqa`)
//!
//! ## Usage
//!
//! ```bash
//! mqa --config ./config/mqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mqa fetch` | Download raw messages into the local cache |
//! | `mqa preprocess` | Normalise raw messages into the processed corpus |
//! | `mqa build-index` | Build and persist the dense and BM25 indices |
//! | `mqa ask "<question>"` | Answer a question with citations |
//! | `mqa insights` | Write the data-quality report |
//! | `mqa evaluate` | Score answers against a gold dataset |
//! | `mqa serve` | Start the HTTP API |
//!
//! Logs go to stderr; set `RUST_LOG` (for example `RUST_LOG=message_qa=debug`)
//! to change verbosity.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use message_qa::{config, evaluation, index, insights, normalize, qa, server, source};

/// Grounded question answering over member messages.
#[derive(Parser)]
#[command(
    name = "mqa",
    about = "Message QA: grounded question answering over member messages",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch raw messages from the configured source.
    ///
    /// HTTP sources send the cached ETag and reuse the cache on 304.
    Fetch {
        /// Ignore the cache and download everything.
        #[arg(long)]
        force: bool,
    },

    /// Normalise raw messages into the processed corpus.
    Preprocess {
        /// Refetch from the source before normalising.
        #[arg(long)]
        force: bool,
    },

    /// Build the dense and BM25 indices.
    ///
    /// Reuses persisted indices when they match the current corpus.
    BuildIndex {
        /// Refetch, renormalise and rebuild from scratch.
        #[arg(long)]
        force: bool,
    },

    /// Answer a question from the member messages.
    Ask {
        question: String,

        /// Refresh the corpus and indices before answering.
        #[arg(long)]
        refresh: bool,
    },

    /// Generate the data-quality insights report.
    Insights,

    /// Evaluate answers against a JSONL gold dataset.
    Evaluate {
        /// Dataset path (defaults to `<data_dir>/eval/gold.jsonl`).
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Report path (defaults to `<reports_dir>/evaluation.json`).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Fetch { force } => {
            source::run_fetch(&cfg, force).await?;
        }
        Commands::Preprocess { force } => {
            normalize::run_preprocess(&cfg, force).await?;
        }
        Commands::BuildIndex { force } => {
            index::run_build_index(&cfg, force).await?;
        }
        Commands::Ask { question, refresh } => {
            qa::run_ask(&cfg, &question, refresh).await?;
        }
        Commands::Insights => {
            insights::run_insights(&cfg).await?;
        }
        Commands::Evaluate { dataset, output } => {
            evaluation::run_evaluate(&cfg, dataset, output).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
