//! # Ingest Harness CLI (`ingest`)
//!
//! Drives configured connectors and the indexing pipeline from the shell.
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest sources` | List configured sources and their health |
//! | `ingest sync <source>` | Run one sync pass and print the result |
//! | `ingest index <source>` | Fetch content and run it through the indexing service |
//! | `ingest strategies` | List available chunking strategies |
//!
//! ## Examples
//!
//! ```bash
//! # Incremental sync of a file source
//! ingest sync docs
//!
//! # Re-fetch everything from an API source and index it sentence by sentence
//! ingest index tickets --full --strategy sentence-based
//!
//! # Verbose logging
//! RUST_LOG=ingest_harness=debug ingest sync kb
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ingest_harness::{config, indexing::IndexingService, ingest, sources};

/// Ingest Harness: connectors and an indexing pipeline for external data.
///
/// All commands read the TOML configuration given by `--config`.
/// See `config/ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ingest",
    about = "Ingest Harness: connectors and an indexing pipeline for external data sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured sources with a one-shot health check.
    Sources,

    /// Run one sync pass against a source.
    ///
    /// Prints the resulting SyncResult as JSON. Incremental unless `--full`.
    Sync {
        /// Source id as configured under `[sources.<id>]`.
        source: String,

        /// Process everything, not just changes since the last pass.
        #[arg(long)]
        full: bool,
    },

    /// Fetch content from a source and index it.
    Index {
        /// Source id as configured under `[sources.<id>]`.
        source: String,

        /// Fetch all content regardless of the last sync time.
        #[arg(long)]
        full: bool,

        /// Chunking strategy; defaults to `indexing.default_strategy`.
        #[arg(long)]
        strategy: Option<String>,
    },

    /// List the chunking strategies available to `index --strategy`.
    Strategies,
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
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Sync { source, full } => {
            ingest::run_sync(&cfg, &source, full).await?;
        }
        Commands::Index {
            source,
            full,
            strategy,
        } => {
            ingest::run_index(&cfg, &source, full, strategy.as_deref()).await?;
        }
        Commands::Strategies => {
            let service = IndexingService::from_config(&cfg).await?;
            let default = &service.config().default_strategy;
            for name in service.get_available_strategies() {
                let marker = if &name == default { " (default)" } else { "" };
                println!("{}{}", name, marker);
            }
        }
    }

    Ok(())
}
