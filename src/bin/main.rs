//! medtune binary.
//!
//! Fine-tunes a distilled reasoning model on medical chain-of-thought data
//! with LoRA, saves the adapter and runs a short generation check.

use anyhow::{Context, Result};
use clap::Parser;
use medtune_core::{pipeline, Args, Settings};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

fn default_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "medtune_core=info,medtune=info",
        1 => "medtune_core=debug,medtune=debug",
        _ => "medtune_core=trace,medtune=trace",
    }
}

fn env_filter(verbose: u8) -> EnvFilter {
    EnvFilter::builder().parse_lossy(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_level(verbose).to_string()),
    )
}

/// Install the subscriber, which also bridges `log` records from
/// dependencies. The returned guard must outlive all logging.
fn init_tracing(verbose: u8) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if let Ok(log_dir) = std::env::var("MEDTUNE_LOG_DIR") {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "medtune.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_env_filter(env_filter(verbose))
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(non_blocking)
            .init();

        info!("File logging enabled to {}/medtune.log", log_dir);
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter(verbose))
            .with_target(true)
            .init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.verbose);

    info!("medtune v{} starting up", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load(&args).context("Configuration validation failed")?;
    pipeline::run(settings).await
}
