//! Stage Pipeline worker
//!
//! Runs one pipeline stage. Configuration comes from `config/*.toml` and
//! `PIPELINE__*` environment variables; the command line only selects the mode.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use stage_pipeline::config::{PipelineStageConfig, ServiceConfig, StoreBackend, StoreConfig};
use stage_pipeline::manifest::ManifestStore;
use stage_pipeline::metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
use stage_pipeline::stage;
use stage_pipeline::store::{MemoryObjectStore, ObjectStore, S3ObjectStore};
use stage_pipeline::worker::StageWorker;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "stage-pipeline")]
#[command(author, version, about = "Run one stage of the object-processing pipeline")]
struct Cli {
    /// Execution mode
    #[arg(long, value_enum, default_value_t = Mode::Poll, env = "PIPELINE_MODE")]
    mode: Mode,

    /// Object keys to process in `once` mode
    #[arg(long, num_args = 1..)]
    keys: Vec<String>,

    /// Remove the processed marker for KEY and exit
    #[arg(long, value_name = "KEY")]
    unmark: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Poll the source prefix until stopped
    Poll,
    /// Process the keys given with --keys and exit
    Once,
    /// Print the latest manifest of this stage and exit
    Latest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = PipelineStageConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        stage = %config.stage.label(),
        mode = ?cli.mode,
        "Starting stage pipeline"
    );

    let store = build_store(&config.store).await?;

    if let Some(key) = cli.unmark.as_deref() {
        let manifests = ManifestStore::new(store, &config.stage.manifest_bucket);
        manifests
            .unmark(&config.stage.dataset_id, config.stage.number, key)
            .await
            .with_context(|| format!("Failed to unmark {}", key))?;
        return Ok(());
    }

    match cli.mode {
        Mode::Latest => {
            let manifests = ManifestStore::new(store, &config.stage.manifest_bucket);
            let latest = manifests
                .latest(&config.stage.dataset_id, config.stage.number)
                .await
                .context("Failed to read latest manifest")?;
            println!("{}", serde_json::to_string_pretty(&latest)?);
        }
        Mode::Once => {
            if cli.keys.is_empty() {
                bail!("--mode once requires --keys");
            }
            let worker = build_worker(&config, store, build_metrics(&config.service)?)?;
            let results = worker.run_once(&cli.keys).await?;

            let failed = results.iter().filter(|r| r.is_failed()).count();
            info!(
                total = results.len(),
                failed = failed,
                "Batch complete"
            );
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Mode::Poll => {
            let worker = build_worker(&config, store, build_metrics(&config.service)?)?;

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    shutdown_signal().await;
                    cancel.cancel();
                }
            });

            if let Err(e) = worker.poll(cancel).await {
                error!(error = %e, "Stage worker stopped");
                return Err(e.into());
            }
        }
    }

    info!("Stage pipeline stopped");
    Ok(())
}

async fn build_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StoreBackend::S3 => {
            let store = S3ObjectStore::new(config)
                .await
                .context("Failed to initialize S3 client")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory object store; nothing will be persisted");
            Ok(Arc::new(MemoryObjectStore::new()))
        }
    }
}

/// Prometheus exporter when enabled, otherwise a sink that drops everything.
fn build_metrics(service: &ServiceConfig) -> Result<Arc<dyn MetricsSink>> {
    if !service.metrics_enabled {
        return Ok(Arc::new(NoopMetrics));
    }
    let metrics = PrometheusMetrics::install(service.metrics_port)
        .context("Failed to install Prometheus metrics exporter")?;
    Ok(Arc::new(metrics))
}

fn build_worker(
    config: &PipelineStageConfig,
    store: Arc<dyn ObjectStore>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<StageWorker<Arc<dyn stage::StageBody>>> {
    let body = stage::from_config(&config.body);
    StageWorker::new(config, store, body, metrics).context("Failed to prepare staging area")
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
