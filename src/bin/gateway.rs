//! # Protocol Gateway
//!
//! Polls heterogeneous industrial devices (Modbus TCP/RTU, OPC UA, Siemens
//! S7) and publishes normalized DataPoints onto the MQTT unified namespace,
//! while accepting write commands back from the broker.
//!
//! ```text
//! Scheduler → Pools/Breakers → Adapters → Publisher → MQTT
//!     ▲                                      │
//!     └────────── Command Handler ◄──────────┘
//! ```

use anyhow::{Context, Result};
use nexus_edge::adapters::opcua;
use nexus_edge::commands::CommandHandler;
use nexus_edge::config::{Config, RegistrySource};
use nexus_edge::health::{HealthServer, Readiness};
use nexus_edge::manager::ProtocolManager;
use nexus_edge::metrics::MetricsServer;
use nexus_edge::model::Protocol;
use nexus_edge::point_pool::PointPool;
use nexus_edge::publisher::{qos_from_u8, Publisher};
use nexus_edge::registry::{self, SharedRegistry};
use nexus_edge::scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Points kept hot in the object pool; sized for a 10k tags/s burst
const POINT_POOL_CAPACITY: usize = 8192;

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("nexus_edge={0},nexus_gateway={0}", config.logging.level).into()
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
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Protocol Gateway");

    // fatal at startup by design: a gateway without devices serves nothing
    let initial = registry::load(&config)
        .await
        .context("loading device registry")?;
    let shared_registry = SharedRegistry::new(initial);

    let points = Arc::new(PointPool::new(POINT_POOL_CAPACITY));
    let manager = Arc::new(ProtocolManager::new(&config, points.clone()));

    let pools_token = CancellationToken::new();
    let maintenance = manager.spawn_maintenance(pools_token.clone());

    // one broker connection multiplexes all publishes
    let (publisher, channels) =
        Publisher::new(config.mqtt.clone(), points.clone()).context("building MQTT publisher")?;
    let mqtt = publisher.handle();
    let publisher_connected = publisher.is_connected();
    let publisher_token = CancellationToken::new();
    let publisher_task = tokio::spawn(publisher.run(publisher_token.clone()));

    // subscription-mode OPC UA devices bypass the scheduler entirely
    let mut subscriptions = Vec::new();
    for device in shared_registry.snapshot().enabled_devices() {
        if device.protocol == Protocol::Opcua
            && device.enable_subscriptions
            && config.opcua.enable_subscriptions
        {
            match opcua::spawn_subscription(
                device.clone(),
                config.opcua.clone(),
                points.clone(),
                channels.points_tx.clone(),
            )
            .await
            {
                Ok(handle) => subscriptions.push(handle),
                Err(e) => {
                    error!(
                        device_id = %device.id,
                        error = %e,
                        "Subscription setup failed; device will not report"
                    )
                }
            }
        }
    }

    let scheduler = Arc::new(Scheduler::new(
        manager.clone(),
        shared_registry.clone(),
        config.polling.clone(),
        channels.points_tx.clone(),
    ));
    let scheduler_token = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(scheduler_token.clone()));

    // registry reloads: SIGHUP or a control-plane notification over MQTT
    let reload_tx = {
        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(4);
        let reload_config = config.clone();
        let reload_registry = shared_registry.clone();
        let reload_scheduler = scheduler.clone();
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                registry::reload(&reload_config, &reload_registry).await;
                reload_scheduler.notify_reload();
            }
        });
        reload_tx
    };

    // command handling: shared subscription, silent drop for foreign devices
    let command_handler = CommandHandler::new(
        shared_registry.clone(),
        manager.clone(),
        config.commands.clone(),
        channels.raw_tx.clone(),
        qos_from_u8(config.mqtt.command_qos),
    );
    if let Err(e) = command_handler.subscribe(&mqtt).await {
        warn!(error = %e, "Command subscription deferred until broker connects");
    }
    if config.registry.source == RegistrySource::Database {
        if let Err(e) = mqtt
            .subscribe("$nexus/config/devices/+/updated", qos_from_u8(1))
            .await
        {
            warn!(error = %e, "Config notification subscription deferred");
        }
    }

    // route inbound publishes: config notifications trigger a reload, the
    // rest goes to the command handler
    let (command_tx, command_rx) = mpsc::channel(1024);
    let router_task = {
        let mut incoming = channels.incoming_rx;
        let reload_tx = reload_tx.clone();
        tokio::spawn(async move {
            while let Some(publish) = incoming.recv().await {
                if publish.topic.starts_with("$nexus/config/") {
                    let _ = reload_tx.try_send(());
                } else if command_tx.send(publish).await.is_err() {
                    break;
                }
            }
        })
    };

    let commands_token = CancellationToken::new();
    let commands_task = tokio::spawn(
        command_handler
            .clone()
            .run(command_rx, commands_token.clone()),
    );

    // observability endpoints
    let readiness = Readiness::default();
    {
        let readiness = readiness.clone();
        let connected = publisher_connected.clone();
        tokio::spawn(async move {
            loop {
                readiness.set(connected.load(Ordering::Relaxed));
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
    let status_cache = Arc::new(std::sync::Mutex::new(serde_json::Value::Null));
    {
        let cache = status_cache.clone();
        let scheduler = scheduler.clone();
        let manager = manager.clone();
        let registry = shared_registry.clone();
        let points = points.clone();
        tokio::spawn(async move {
            loop {
                let status = serde_json::json!({
                    "service": "nexus-gateway",
                    "devices": registry.snapshot().len(),
                    "polling": scheduler.stats_snapshot(),
                    "pools": manager.stats().await,
                    "point_pool": points.stats(),
                });
                *cache.lock().expect("status cache poisoned") = status;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
    let health = HealthServer::new(
        config.http.app_port,
        readiness,
        Arc::new(move || status_cache.lock().expect("status cache poisoned").clone()),
    );
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

    info!("Gateway ready");
    wait_for_shutdown(&reload_tx).await;

    // drain in dependency order: stop accepting commands, finish in-flight
    // polls, close device pools, then let the publisher disconnect
    info!("Shutting down: stopping command handler");
    commands_token.cancel();
    let _ = commands_task.await;

    info!("Draining scheduler");
    scheduler_token.cancel();
    let _ = scheduler_task.await;

    for handle in &subscriptions {
        handle.stop();
    }

    pools_token.cancel();
    for task in maintenance {
        let _ = task.await;
    }
    manager.close_all().await;

    publisher_token.cancel();
    let _ = publisher_task.await;
    router_task.abort();

    info!("Protocol Gateway stopped");
    Ok(())
}

/// Block until SIGINT/SIGTERM; SIGHUP reloads the registry in place
async fn wait_for_shutdown(reload_tx: &mpsc::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut sigterm =
            unix_signal(SignalKind::terminate()).expect("SIGTERM handler installation");
        let mut sighup = unix_signal(SignalKind::hangup()).expect("SIGHUP handler installation");
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("SIGINT received");
                    return;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    return;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading registry");
                    let _ = reload_tx.try_send(());
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = reload_tx;
        let _ = signal::ctrl_c().await;
        info!("SIGINT received");
    }
}
