//! # neuralfm CLI
//!
//! ## Usage
//!
//! ```bash
//! neuralfm --config ./config/neuralfm.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `neuralfm init` | Create the configured databases and snapshot index |
//! | `neuralfm sources` | List configured sources |
//! | `neuralfm scrape` | Scrape sources until none has anything new |
//! | `neuralfm extract` | Attach feature documents to unprocessed records |
//! | `neuralfm classify <source> <fingerprint> <label>` | Label one record |
//! | `neuralfm train` | Train and save stale models, one per compatible source |
//! | `neuralfm show [fingerprint]` | List snapshots or describe one |
//! | `neuralfm predict <fingerprint> <text>` | Score text with a stored model |
//! | `neuralfm reset-models` | Delete every stored snapshot |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `neuralfm=info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use neuralfm::{config, extract, migrate, scrape, sources, train_cmd};

/// neuralfm: collect, classify and learn from your feeds.
#[derive(Parser)]
#[command(name = "neuralfm", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/neuralfm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every configured database and the snapshot index.
    ///
    /// Idempotent.
    Init,

    /// List configured sources.
    Sources,

    /// Scrape sources in priority order.
    ///
    /// Repeats on `[scrape].interval_ms` until a pass finds nothing new.
    Scrape {
        /// Maximum new records per source call.
        #[arg(long)]
        limit: Option<usize>,

        /// Source-specific filter (a file glob for filesystem sources).
        #[arg(long)]
        filter: Option<String>,

        /// Run a single pass instead of draining.
        #[arg(long)]
        once: bool,
    },

    /// Extract features for records that have none yet.
    Extract {
        /// Only run this extractor.
        #[arg(long)]
        extractor: Option<String>,
    },

    /// Label a record.
    Classify {
        source: String,
        fingerprint: String,
        label: String,

        /// Target value the network learns for this label.
        #[arg(long, default_value_t = 1.0)]
        value: f64,
    },

    /// Train and save models whose classifications or data changed.
    Train {
        /// Only train the model for this source.
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value = "twitter")]
        extractor: String,

        /// Retrain even when the latest snapshot is up to date.
        #[arg(long)]
        force: bool,
    },

    /// List stored model snapshots, or show one.
    Show { fingerprint: Option<String> },

    /// Score text with a stored model snapshot.
    Predict { fingerprint: String, text: String },

    /// Delete every stored model snapshot.
    ResetModels,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("neuralfm=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::init(&cfg).await?;
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Scrape {
            limit,
            filter,
            once,
        } => {
            scrape::run_scrape(&cfg, limit, filter, once).await?;
        }
        Commands::Extract { extractor } => {
            extract::run_extract(&cfg, extractor.as_deref()).await?;
        }
        Commands::Classify {
            source,
            fingerprint,
            label,
            value,
        } => {
            train_cmd::run_classify(&cfg, &source, &fingerprint, &label, value).await?;
        }
        Commands::Train {
            source,
            extractor,
            force,
        } => {
            train_cmd::run_train(&cfg, source.as_deref(), &extractor, force).await?;
        }
        Commands::Show { fingerprint } => {
            train_cmd::run_show(&cfg, fingerprint.as_deref()).await?;
        }
        Commands::Predict { fingerprint, text } => {
            train_cmd::run_predict(&cfg, &fingerprint, &text).await?;
        }
        Commands::ResetModels => {
            train_cmd::run_reset_models(&cfg).await?;
        }
    }

    Ok(())
}
