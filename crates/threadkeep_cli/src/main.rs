//! threadkeep CLI - ingest comment threads into a local database.

mod commands;
mod config;
mod progress;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::Term;
use threadkeep::CancelSignal;
use tracing_subscriber::EnvFilter;

use crate::commands::OutputFormat;

#[derive(Parser)]
#[command(name = "threadkeep")]
#[command(version)]
#[command(about = "Incremental comment and reply ingestion")]
#[command(
    long_about = "threadkeep walks a paginated comment feed by continuation token, stores a \
deduplicated copy of every comment in a local database, then fetches reply threads through a \
bounded worker pool that backs off on throttling. Re-running an ingest converges on the same \
rows instead of duplicating them."
)]
#[command(after_long_help = r#"EXAMPLES
    Ingest a partition starting from a bootstrap token:
        $ threadkeep ingest video-123 EgZ2aWRlbxgB --endpoint https://example.com/comments

    Main comments only, stop after 20 pages:
        $ threadkeep ingest video-123 EgZ2aWRlbxgB --no-replies --max-pages 20

    Show what is stored:
        $ threadkeep stats video-123

    Generate shell completions:
        $ threadkeep completions bash > ~/.local/share/bash-completion/completions/threadkeep

CONFIGURATION
    threadkeep reads configuration from:
      1. ~/.config/threadkeep/config.toml (or $XDG_CONFIG_HOME/threadkeep/config.toml)
      2. ./threadkeep.toml
      3. Environment variables (THREADKEEP_ prefix, "__" between section and key)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    THREADKEEP_DATABASE__URL               Database connection string (default: ~/.local/state/threadkeep/threadkeep.db)
    THREADKEEP_SOURCE__ENDPOINT            Comment feed endpoint
    THREADKEEP_SOURCE__REQUESTS_PER_SECOND Proactive request rate (0 disables)
    THREADKEEP_REPLIES__CONCURRENCY        Concurrent reply fetches
    THREADKEEP_REPLIES__MAX_RETRIES        Retries per reply page on transient errors
    RUST_LOG                               Log filter when stdout is not a terminal
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Crawl a partition's comments and fetch their replies
    Ingest(IngestArgs),
    /// Show stored counts for a partition
    Stats {
        /// Partition (e.g. video id) to inspect
        partition: String,

        /// Number of reply threads to list
        #[arg(short, long, default_value_t = 10)]
        top: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
    /// Generate man page(s)
    Man {
        /// Output directory for man pages (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
    /// Fresh install - drop all tables and reapply migrations
    Fresh,
}

#[derive(Debug, Clone, clap::Args)]
struct IngestArgs {
    /// Partition (e.g. video id) the comments belong to
    partition: String,

    /// Continuation token of the first page
    token: String,

    /// Comment feed endpoint (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Extra request header, NAME=VALUE (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Only crawl main comments
    #[arg(long)]
    no_replies: bool,

    /// Stop the crawl after this many pages
    #[arg(short, long)]
    max_pages: Option<usize>,

    /// The partition has never been ingested; skip existence checks
    #[arg(long)]
    fresh: bool,

    /// Concurrent reply fetches (default from config or 4)
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Disable proactive rate limiting (may cause API throttling)
    #[arg(short = 'R', long)]
    no_rate_limit: bool,

    /// Output format for the summary
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Structured logging only when stdout is not a terminal
    if !Term::stdout().is_term() {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("threadkeep=info,threadkeep_cli=info"),
        };

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    // Config file -> env vars -> defaults
    let config = config::Config::load();

    let cli = Cli::parse();

    // Commands that don't need the database
    match &cli.command {
        Commands::Completions { shell } => {
            commands::meta::handle_completions(*shell)?;
            return Ok(());
        }
        Commands::Man { output } => {
            commands::meta::handle_man(output.clone())?;
            return Ok(());
        }
        _ => {}
    }

    let database_url = config
        .database_url()
        .ok_or("Could not determine a database location; set THREADKEEP_DATABASE__URL")?;

    if database_url.starts_with("sqlite://") {
        let db_path = database_url.trim_start_matches("sqlite://");
        // Strip query parameters (e.g., ?mode=rwc) before path operations
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        let db_path = std::path::Path::new(db_path);

        if db_path.is_relative() && !db_path.as_os_str().is_empty() {
            tracing::warn!(
                "Database path '{}' is relative - behavior depends on current directory. \
                 Consider using an absolute path.",
                db_path.display()
            );
        }

        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }

    match cli.command {
        Commands::Migrate { action } => {
            commands::migrate::handle_migrate(action, &database_url).await?;
        }
        Commands::Ingest(args) => {
            let cancel = CancelSignal::new();
            shutdown::setup_shutdown_handler(cancel.clone());
            commands::ingest::handle_ingest(args, &config, &database_url, cancel).await?;
        }
        Commands::Stats {
            partition,
            top,
            output,
        } => {
            commands::stats::handle_stats(partition, top, output, &database_url).await?;
        }
        Commands::Completions { .. } | Commands::Man { .. } => {}
    }

    Ok(())
}
