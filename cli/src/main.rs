//! Stevedore CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stevedore_cli::commands::{dispatch, log_directive, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // --log-level, then RUST_LOG, then the config file
    let filter = match cli.global.log_level {
        Some(_) => EnvFilter::new(log_directive(&cli.global)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_directive(&cli.global))),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
