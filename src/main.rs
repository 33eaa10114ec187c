//! # Support Labeler CLI (`labeler`)
//!
//! Labels support conversations using a library of human-labeled samples
//! and a few-shot prompted chat model.
//!
//! ## Usage
//!
//! ```bash
//! labeler --config ./config/labeler.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `labeler ingest <samples>` | Build the sample library and vector index |
//! | `labeler label <conversations>` | Label a batch and write the output sinks |
//! | `labeler retrieve <conversations>` | Print nearest samples per conversation |
//! | `labeler mask [text]` | Mask PII in text (or stdin) |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest labeled samples (JSON array or JSON Lines)
//! labeler ingest data/samples.jsonl
//!
//! # Label conversations with the persisted library
//! OPENAI_API_KEY=... labeler label data/conversations.jsonl --out ./out
//!
//! # Check masking
//! labeler mask "010-1234-5678 로 연락주세요"
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use support_labeler::commands;
use support_labeler::config::{self, Config};

const DEFAULT_CONFIG: &str = "./config/labeler.toml";

/// Support Labeler: retrieval-augmented labeling of support conversations.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/labeler.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "labeler",
    about = "Retrieval-augmented labeling of support conversations",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/labeler.toml`; built-in defaults are used when
    /// that file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest labeled samples into the library and vector index.
    ///
    /// Required columns: `label_primary` and `summary`. Rows sharing a
    /// `sample_id` with the existing library overwrite it.
    Ingest {
        /// Sample file (JSON array or JSON Lines).
        samples: PathBuf,

        /// Origin recorded on every ingested sample. Defaults to the file name.
        #[arg(long)]
        origin: Option<String>,

        /// Discard the existing library instead of merging into it.
        #[arg(long)]
        replace: bool,

        /// Output directory (overrides `[output] dir`).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Label a batch of conversations.
    ///
    /// Writes `labels.jsonl`, `labels_flat.jsonl`, `skipped.jsonl` and
    /// `failed.jsonl`, then prints a summary.
    Label {
        /// Conversation file (JSON array or JSON Lines).
        conversations: PathBuf,

        /// Sample file to use instead of the persisted library.
        #[arg(long)]
        samples: Option<PathBuf>,

        /// Output directory (overrides `[output] dir`).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the nearest samples for each conversation.
    Retrieve {
        /// Conversation file (JSON array or JSON Lines).
        conversations: PathBuf,

        /// Sample file to use instead of the persisted library.
        #[arg(long)]
        samples: Option<PathBuf>,

        /// Number of matches (overrides `[retrieval] top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Directory holding a persisted library.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Mask phone numbers, account numbers and addresses.
    Mask {
        /// Text to mask. Reads stdin when omitted.
        text: Option<String>,
    },
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                config::load_config(default)
            } else {
                info!("no config file at {}; using defaults", DEFAULT_CONFIG);
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Masking needs no configuration.
    if let Commands::Mask { text } = &cli.command {
        return commands::run_mask(text.as_deref());
    }

    let cfg = load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest {
            samples,
            origin,
            replace,
            out,
        } => {
            commands::run_ingest(&cfg, &samples, origin.as_deref(), replace, out.as_deref())
                .await?;
        }
        Commands::Label {
            conversations,
            samples,
            out,
        } => {
            commands::run_label(&cfg, &conversations, samples.as_deref(), out.as_deref()).await?;
        }
        Commands::Retrieve {
            conversations,
            samples,
            top_k,
            out,
        } => {
            commands::run_retrieve(
                &cfg,
                &conversations,
                samples.as_deref(),
                top_k,
                out.as_deref(),
            )
            .await?;
        }
        Commands::Mask { .. } => {}
    }

    Ok(())
}
