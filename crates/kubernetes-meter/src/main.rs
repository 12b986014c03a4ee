//! Kubernetes Meter - forwards queued APEL records to a Gratia collector

use anyhow::{Context, Result};
use clap::Parser;
use gratia_common::forwarder::CollectorForwarder;
use gratia_common::logging::{init_logging, LogConfig};
use gratia_common::vo::VoResolver;
use kubernetes_meter::{DirQueue, Meter, MeterConfig, MeterOptions, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "kubernetes-meter")]
#[command(author, version, about = "Forward Kubernetes APEL accounting records to a Gratia collector")]
struct Cli {
    /// Environment file with GRATIA_* and LOG_* settings
    #[arg(short, long)]
    env_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The env file may carry LOG_* settings, so load it before logging starts
    let config = MeterConfig::load(cli.env_file.as_deref());

    let log_config = LogConfig {
        level: if cli.verbose { Level::DEBUG } else { Level::INFO },
        log_file_prefix: "kubernetes-meter".to_string(),
        ..LogConfig::default()
    };

    // Environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Warning: ignoring invalid logging settings: {:#}", e);
            log_config
        },
    };

    // Dropping the guard flushes the file writer, so it must outlive every log call below
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        },
    };

    let result = match config.context("Failed to load configuration") {
        Ok(config) => {
            if let Some(path) = &cli.env_file {
                debug!(env_file = %path.display(), "Loaded environment file");
            }
            run(config).await
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(summary) => {
            info!(
                forwarded = summary.forwarded,
                removed = summary.removed,
                skipped = summary.skipped,
                "Kubernetes meter finished"
            );
            ExitCode::SUCCESS
        },
        Err(e) => {
            error!(error = %format!("{:#}", e), "Kubernetes meter failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(config: MeterConfig) -> Result<RunSummary> {
    info!(
        queue = %config.queue_dir.display(),
        collector = %config.collector_url,
        batch_size = config.batch_size,
        "Starting Kubernetes meter"
    );

    let resolver = Arc::new(VoResolver::new(config.user_vo_map.clone()));
    let forwarder = CollectorForwarder::new(config.collector_settings())
        .context("Failed to set up collector forwarder")?;
    let queue = DirQueue::open(&config.queue_dir)
        .with_context(|| format!("Failed to open queue {}", config.queue_dir.display()))?;

    let mut meter = Meter::new(queue, forwarder, resolver, MeterOptions::from(&config));
    let summary = meter.run().await.context("Failed to forward queued records")?;

    Ok(summary)
}
