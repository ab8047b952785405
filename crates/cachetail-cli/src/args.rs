use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cachetail")]
#[command(about = "Ingest a caching proxy's access log into download sessions and stats", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file. A missing file means built-in defaults.
    #[arg(long, default_value = "cachetail.toml", global = true)]
    pub config: PathBuf,

    /// Override the access log path from the config.
    #[arg(long, global = true)]
    pub log_path: Option<PathBuf>,

    /// Override the database path from the config.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Tail the access log and ingest continuously until ctrl-c.
    Run {
        /// Suppress the live event channel during bulk catch-up.
        #[arg(long)]
        high_throughput: bool,

        /// On first run, start at the end of the log instead of its history.
        #[arg(long)]
        start_from_end: bool,
    },

    /// Print lifetime client/service aggregates and active downloads.
    Stats,

    /// Print a throughput snapshot over the trailing window.
    Speed {
        /// Window length in seconds.
        #[arg(long, default_value = "20")]
        window: i64,
    },
}
