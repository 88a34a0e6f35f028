//! # Ferry Worker
//!
//! Runs the job engine against Redis:
//! - Claims jobs with a bounded worker pool
//! - Retries, breaks circuits and dead-letters per `config/*.toml`
//! - Periodically requeues abandoned claims, recovers and expires dead letters
//! - Exposes Prometheus metrics when enabled

use ferry_core::{FerryError, FerryResult};
use ferry_jobs::redis::{create_pool, RedisDeadLetterBackend, RedisJobQueue, RedisMetricsSink};
use ferry_jobs::{
    register_metrics, BufferedMetricsRecorder, DeadLetterStore, JobQueueService, MetricsRecorder,
    WorkerPool, WorkerPoolConfig,
};
use loader::{AppConfig, ConfigLoader, LoggingConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod handlers;
mod loader;

#[tokio::main]
async fn main() {
    let loader = ConfigLoader::from_default_location();
    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            init_logging(&LoggingConfig::default());
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.logging);

    info!("Starting Ferry worker...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", loader.environment());

    if let Err(e) = run(config).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> FerryResult<()> {
    let jobs = config.jobs;

    if jobs.metrics.enabled {
        let addr = config.exporter.socket_addr()?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| FerryError::Other(anyhow::anyhow!("Failed to install Prometheus exporter: {}", e)))?;
        register_metrics();
        info!("Metrics available at http://{}/metrics", addr);
    }

    let redis = create_pool(&jobs.redis).await?;

    let queue = Arc::new(RedisJobQueue::new(redis.clone(), &jobs.redis));
    queue.health_check().await?;
    let dead_letters = Arc::new(DeadLetterStore::new(
        Arc::new(RedisDeadLetterBackend::new(redis.clone(), &jobs.redis)),
        jobs.dead_letter_queue.clone(),
    ));
    let recorder = Arc::new(BufferedMetricsRecorder::spawn(
        Arc::new(RedisMetricsSink::new(redis, &jobs.redis, &jobs.metrics)),
        &jobs.metrics,
    ));

    let service = Arc::new(JobQueueService::new(
        jobs.clone(),
        queue.clone(),
        handlers::default_handlers(),
        dead_letters,
        recorder.clone() as Arc<dyn MetricsRecorder>,
    ));

    let (maintenance_tx, maintenance_rx) = watch::channel(false);
    let maintenance = spawn_maintenance(
        service.clone(),
        Duration::from_secs(jobs.dead_letter_queue.cleanup_interval_secs.max(1)),
        jobs.worker.job_timeout().max(Duration::from_secs(1)),
        maintenance_rx,
    );

    let pool = Arc::new(WorkerPool::new(service, WorkerPoolConfig::from(&jobs.worker)));
    let worker = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.start().await })
    };

    shutdown_signal().await;

    pool.stop();
    let _ = maintenance_tx.send(true);

    let result = match worker.await {
        Ok(result) => result,
        Err(e) => Err(FerryError::internal(format!("Worker pool task failed: {}", e))),
    };

    if let Err(e) = maintenance.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }

    recorder.shutdown().await;

    info!("Worker shutdown complete");
    result
}

/// Until `shutdown` flips: requeues stale claims every `stale_every`, and
/// every `every` recovers dead letters, applies retention and purges
/// expired job records.
fn spawn_maintenance(
    service: Arc<JobQueueService>,
    every: Duration,
    stale_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stale_ticker = tokio::time::interval(stale_every);
        stale_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        stale_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = stale_ticker.tick() => {
                    if let Err(e) = service.recover_stale_jobs().await {
                        error!(error = %e, "Failed to recover stale jobs");
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if service.config().dead_letter_queue.enabled {
                match service.process_dead_letters().await {
                    Ok(outcome) if outcome.processed > 0 => info!(
                        processed = outcome.processed,
                        recovered = outcome.recovered,
                        failed = outcome.failed,
                        "Dead letter recovery pass finished"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Dead letter recovery failed"),
                }

                match service.cleanup_dead_letters().await {
                    Ok(outcome) => {
                        if outcome.cleaned > 0 {
                            info!(cleaned = outcome.cleaned, "Expired dead letters removed");
                        }
                        for e in outcome.errors {
                            warn!(error = %e, "Dead letter cleanup error");
                        }
                    }
                    Err(e) => error!(error = %e, "Dead letter cleanup failed"),
                }
            }

            match service.purge_finished_jobs().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged finished job records"),
                Err(e) => error!(error = %e, "Failed to purge finished jobs"),
            }
        }
    })
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let (json, plain) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
