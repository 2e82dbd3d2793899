//! Configuration file support for threadkeep.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `THREADKEEP_`, sections separated
//!    by a double underscore, e.g. `THREADKEEP_DATABASE__URL`)
//! 3. Config file (./threadkeep.toml, then ~/.config/threadkeep/config.toml)
//! 4. Built-in defaults
//!
//! The database URL defaults to `sqlite://~/.local/state/threadkeep/threadkeep.db`
//! on Linux (using the XDG state directory) if not explicitly configured.
//!
//! Example config file:
//! ```toml
//! [database]
//! url = "sqlite://~/.local/state/threadkeep/threadkeep.db"  # optional, this is the default
//!
//! [source]
//! endpoint = "https://comments.example.com/v1/next"
//! requests_per_second = 5
//! timeout_secs = 30
//!
//! [crawl]
//! batch_size = 500
//! max_pages = 1000
//!
//! [replies]
//! concurrency = 4
//! max_retries = 3
//! initial_backoff_ms = 2000
//! rate_limit_cooldown_ms = 60000
//! request_timeout_ms = 30000
//! max_rate_limit_hits = 5
//! pacing_ms = 250
//! ```

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use threadkeep::source::rate_limits;
use threadkeep::{CrawlConfig, Pacing, ReplyQueueConfig, RetryPolicy};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Remote comment source.
    pub source: SourceConfig,
    /// Main-thread crawl tuning.
    pub crawl: CrawlSettings,
    /// Reply queue tuning.
    pub replies: ReplySettings,
}

/// Database configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL.
    /// Supports sqlite:// and postgres:// schemes.
    /// Defaults to `sqlite://~/.local/state/threadkeep/threadkeep.db` if not specified.
    pub url: Option<String>,
}

/// Remote source configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Endpoint receiving `{continuation, isReply}` POSTs.
    pub endpoint: Option<String>,
    /// Client-side request budget. Zero disables proactive throttling.
    pub requests_per_second: u32,
    /// Timeout for a single HTTP request.
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            requests_per_second: rate_limits::DEFAULT_RPS,
            timeout_secs: 30,
        }
    }
}

/// Crawl configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    pub batch_size: usize,
    pub max_pages: Option<usize>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            batch_size: threadkeep::accumulator::DEFAULT_BATCH_SIZE,
            max_pages: None,
        }
    }
}

/// Reply queue configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReplySettings {
    pub concurrency: usize,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub request_timeout_ms: u64,
    /// Zero lets a task wait out any number of rate limits.
    pub max_rate_limit_hits: u32,
    /// Base delay between reply task dispatches. Zero disables pacing.
    pub pacing_ms: u64,
}

impl Default for ReplySettings {
    fn default() -> Self {
        let defaults = ReplyQueueConfig::default();
        Self {
            concurrency: defaults.concurrency,
            max_retries: defaults.retry.max_retries,
            initial_backoff_ms: defaults.retry.initial_backoff.as_millis() as u64,
            rate_limit_cooldown_ms: defaults.rate_limit_cooldown.as_millis() as u64,
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
            max_rate_limit_hits: defaults.max_rate_limit_hits.unwrap_or(0),
            pacing_ms: 0,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/threadkeep/config.toml)
    /// 3. Local config file (./threadkeep.toml)
    /// 4. Environment variables with THREADKEEP_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        // Add XDG config file if it exists
        if let Some(path) = Self::default_config_path()
            && path.exists()
        {
            tracing::debug!("Loading config from {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        // Add local config file (higher priority than XDG)
        let local_config = PathBuf::from("threadkeep.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./threadkeep.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // e.g., THREADKEEP_REPLIES__MAX_RETRIES -> replies.max_retries
        builder = builder.add_source(Self::environment());

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    fn environment() -> Environment {
        Environment::with_prefix("THREADKEEP")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Get the database URL, falling back to the default state directory path.
    ///
    /// The `mode=rwc` parameter enables read-write access and creates the file if it doesn't exist.
    pub fn database_url(&self) -> Option<String> {
        self.database.url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("threadkeep.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    /// Get the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "threadkeep").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/threadkeep` or `~/.local/state/threadkeep`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "threadkeep").map(|dirs| {
            // state_dir() returns None on macOS/Windows, fall back to data_dir
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }

    pub fn crawl_config(&self) -> CrawlConfig {
        CrawlConfig::default()
            .with_batch_size(self.crawl.batch_size)
            .with_max_pages(self.crawl.max_pages)
    }

    pub fn reply_config(&self) -> ReplyQueueConfig {
        let r = &self.replies;
        let pacing = (r.pacing_ms > 0).then(|| Pacing::new(Duration::from_millis(r.pacing_ms)));
        ReplyQueueConfig::default()
            .with_concurrency(r.concurrency)
            .with_max_retries(r.max_retries)
            .with_initial_backoff(Duration::from_millis(r.initial_backoff_ms))
            .with_rate_limit_cooldown(Duration::from_millis(r.rate_limit_cooldown_ms))
            .with_request_timeout(Duration::from_millis(r.request_timeout_ms))
            .with_max_rate_limit_hits((r.max_rate_limit_hits > 0).then_some(r.max_rate_limit_hits))
            .with_pacing(pacing)
    }

    /// Backoff for the main crawl, shared with the reply settings.
    pub fn crawl_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.replies.initial_backoff_ms),
            self.replies.max_retries,
        )
    }
}
