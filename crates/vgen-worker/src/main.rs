//! Generation and export worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vgen_media::{check_ffmpeg, FfmpegTranscoder, Transcoder};
use vgen_queue::{QueueConfig, QueueManager};
use vgen_render::{OperationPoller, RenderClient};
use vgen_storage::{LocalStorage, LocalStorageConfig, MediaStorage, R2Storage};
use vgen_worker::{
    ExportWorker, GenerationWorker, InMemoryRecords, MediaRecords, WorkerConfig, WorkerPool,
};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vgen=info,info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn storage_from_env() -> anyhow::Result<Arc<dyn MediaStorage>> {
    let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "r2".to_string());
    match backend.to_lowercase().as_str() {
        "local" => {
            let config = LocalStorageConfig::from_env();
            info!(root = %config.root.display(), "Using local storage");
            Ok(Arc::new(LocalStorage::new(config)))
        }
        "r2" | "s3" => {
            let storage = R2Storage::from_env().context("failed to configure R2 storage")?;
            if let Err(e) = storage.check_connectivity().await {
                warn!("R2 bucket check failed, transfers will be retried per job: {}", e);
            }
            Ok(Arc::new(storage))
        }
        other => anyhow::bail!("unknown STORAGE_BACKEND: {}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting vgen-worker");

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("invalid METRICS_ADDR")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Metrics exporter listening");
    }

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Err(e) = check_ffmpeg() {
        warn!("FFmpeg not available, export jobs will fail: {}", e);
    }

    let manager = Arc::new(QueueManager::connect(QueueConfig::from_env()).await);
    let storage = storage_from_env().await?;
    let records: Arc<dyn MediaRecords> = Arc::new(InMemoryRecords::new());
    let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new());

    let render = Arc::new(RenderClient::from_env().context("failed to create render client")?);
    if !render.health_check().await {
        warn!("Render service health check failed; generation jobs may fail until it recovers");
    }
    let poller = OperationPoller::new(render.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = poller.spawn_stale_sweeper(config.stale_sweep_interval, shutdown_rx.clone());
    manager.spawn_maintenance(shutdown_rx);

    let generation = GenerationWorker::new(
        render,
        poller,
        storage.clone(),
        transcoder.clone(),
        records.clone(),
    )
    .with_poll_options(config.poll.clone())
    .with_key_prefix(config.generated_prefix.clone());
    let export = ExportWorker::new(storage, transcoder, records.clone())
        .with_key_prefix(config.export_prefix.clone())
        .with_transcode_timeout(config.transcode_timeout);

    let generation_pool = Arc::new(WorkerPool::new(
        manager.generation_queue().clone(),
        generation,
        records.clone(),
        config.pool_config(config.generation_concurrency),
    ));
    let export_pool = Arc::new(WorkerPool::new(
        manager.export_queue().clone(),
        export,
        records,
        config.pool_config(config.export_concurrency),
    ));

    let generation_task = {
        let pool = generation_pool.clone();
        tokio::spawn(async move { pool.run().await })
    };
    let export_task = {
        let pool = export_pool.clone();
        tokio::spawn(async move { pool.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    generation_pool.shutdown();
    export_pool.shutdown();
    let drained = manager.shutdown(config.shutdown_timeout).await;
    if !drained {
        warn!("Queues still had active jobs at shutdown");
    }
    let _ = shutdown_tx.send(true);

    for (name, task) in [("generation", generation_task), ("export", export_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(pool = name, "Worker pool error: {}", e),
            Err(e) => error!(pool = name, "Worker pool task failed: {}", e),
        }
    }
    sweeper.await.ok();

    info!("Worker shutdown complete");
    Ok(())
}
