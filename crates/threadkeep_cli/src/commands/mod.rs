pub(crate) mod ingest;
pub(crate) mod meta;
pub(crate) mod migrate;
pub(crate) mod stats;

use clap::ValueEnum;

/// Output format for summaries.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Display as a formatted table (default)
    #[default]
    Table,
    /// Display as JSON
    Json,
}
