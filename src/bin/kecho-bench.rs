//! kecho-bench: round-trip latency benchmark for the kecho daemon.

use clap::Parser;
use kecho::bench::{self, BenchArgs};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = BenchArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    bench::run(&args).await?;
    Ok(())
}
