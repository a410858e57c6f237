use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "nidb",
    about = "Inspect event dumps with the nidb engine",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Engine configuration (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the events matching any filter, newest first
    Query(QueryArgs),
    /// Count the events matching any filter
    Count(QueryArgs),
    /// Show per-kind and per-author totals
    Stats(DumpArgs),
    /// Show which events pruning would evict
    Prune(PruneArgs),
    /// Emit fixture events as JSON lines
    Generate(GenerateArgs),
}

#[derive(Args)]
pub struct DumpArgs {
    /// JSON-lines file, one event per line
    pub dump: PathBuf,
}

#[derive(Args)]
pub struct QueryArgs {
    /// JSON-lines file, one event per line
    pub dump: PathBuf,
    /// Filter as JSON, e.g. '{"kinds":[1],"limit":10}'. Repeat for OR.
    #[arg(short, long = "filter", required = true)]
    pub filters: Vec<String>,
    /// Override the configured query strategy
    #[arg(long)]
    pub strategy: Option<String>,
}

#[derive(Args)]
pub struct PruneArgs {
    pub dump: PathBuf,
    /// Target store size; defaults to the configured max_events
    #[arg(long)]
    pub max_events: Option<usize>,
}

#[derive(Args)]
pub struct GenerateArgs {
    #[arg(short = 'n', long, default_value = "100")]
    pub count: usize,
    /// Number of distinct authors
    #[arg(long, default_value = "5")]
    pub authors: usize,
    /// Timestamp of the first event
    #[arg(long, default_value = "1700000000")]
    pub start: u64,
}
