//! # Data Ingestion Service
//!
//! Consumes the telemetry stream from the MQTT broker over a shared
//! subscription, batches points, and bulk-loads them into the time-series
//! store with at-least-once semantics.
//!
//! ```text
//! MQTT ($share/ingestion/...) → Subscriber → Batcher → Writers → TSDB
//! ```

use anyhow::{Context, Result};
use nexus_edge::batcher::Batcher;
use nexus_edge::config::Config;
use nexus_edge::health::{HealthServer, Readiness};
use nexus_edge::metrics::MetricsServer;
use nexus_edge::subscriber::Subscriber;
use nexus_edge::tsdb_writer::TsdbWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("nexus_edge={0},nexus_ingestion={0}", config.logging.level).into()
    });
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("NEXUS_CONFIG").ok())
        .map(PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match config_path() {
        Some(path) => Config::load(&path).context("loading configuration")?,
        None => Config::from_env().context("loading configuration from environment")?,
    };
    init_tracing(&config);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Data Ingestion Service");

    // unreachable database is fatal at startup, never mid-run
    let writer = TsdbWriter::connect(config.tsdb.clone())
        .await
        .context("connecting to time-series store")?;
    if !writer.ping().await {
        anyhow::bail!("time-series store did not answer ping");
    }

    let batcher = Batcher::new(config.ingestion.clone());
    let (point_tx, point_rx) = mpsc::channel(config.ingestion.channel_capacity);
    let (batch_tx, batch_rx) = mpsc::channel(batcher.writer_channel_capacity());

    let writer_tasks = writer.spawn_writers(batch_rx, config.ingestion.writer_count);

    let batcher_token = CancellationToken::new();
    let batcher_task = tokio::spawn(batcher.run(point_rx, batch_tx, batcher_token.clone()));

    let subscriber = Subscriber::new(config.mqtt.clone(), config.ingestion.clone());
    let subscriber_token = CancellationToken::new();
    let subscriber_task = {
        let token = subscriber_token.clone();
        tokio::spawn(async move {
            if let Err(e) = subscriber.run(point_tx, token).await {
                error!(error = %e, "Subscriber failed");
            }
        })
    };

    // observability endpoints
    let readiness = Readiness::default();
    {
        let readiness = readiness.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            loop {
                readiness.set(writer.ping().await);
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });
    }
    let status = {
        let config = config.ingestion.clone();
        Arc::new(move || {
            serde_json::json!({
                "service": "nexus-ingestion",
                "batch_size": config.batch_size,
                "flush_interval_ms": config.flush_interval_ms,
                "writer_count": config.writer_count,
                "channel_capacity": config.channel_capacity,
            })
        })
    };
    let health = HealthServer::new(config.http.app_port, readiness, status);
    tokio::spawn(async move {
        if let Err(e) = health.serve().await {
            error!(error = %e, "Health server error");
        }
    });
    let metrics = MetricsServer::new(config.http.metrics_port);
    tokio::spawn(async move {
        if let Err(e) = metrics.serve().await {
            error!(error = %e, "Metrics server error");
        }
    });

    info!("Ingestion ready");
    wait_for_shutdown().await;

    // stop intake first, then flush: the batcher drains the channel and
    // seals the in-flight batch; writers exit when the batch channel closes
    info!("Shutting down: stopping subscriber");
    subscriber_token.cancel();
    let _ = subscriber_task.await;

    info!("Flushing batcher");
    batcher_token.cancel();
    let _ = batcher_task.await;

    let drain = Duration::from_secs(config.polling.shutdown_timeout_secs);
    for task in writer_tasks {
        if tokio::time::timeout(drain, task).await.is_err() {
            warn!("Writer did not finish within the shutdown window");
        }
    }

    writer.close().await;
    info!("Data Ingestion Service stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut sigterm =
            unix_signal(SignalKind::terminate()).expect("SIGTERM handler installation");
        tokio::select! {
            _ = signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("SIGINT received");
    }
}
