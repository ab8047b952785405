mod args;
mod commands;

use args::Cli;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = commands::run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
