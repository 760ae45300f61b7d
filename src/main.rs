mod cli;
mod config;
mod engine;
mod error;
mod jobs;
mod model;
mod orchestrator;
mod platform;
mod session;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Logs go to stderr so stdout carries only notices.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match args.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run(args).await?;
    // A stdin read may still be parked on the blocking pool; don't wait for it.
    std::process::exit(0);
}
