//! Polling scheduler
//!
//! One ticker per enabled device, offset by a random jitter of up to a tenth
//! of the interval so fleets sharing an interval do not fire in lockstep.
//! Ticks attempt a non-blocking acquire on the worker semaphore; when every
//! worker is busy the tick is skipped and counted, never queued. The
//! scheduler never inspects the circuit breaker: it always calls through the
//! pool, and treats a breaker rejection as a skip rather than a failure, so
//! recovery is automatic once the breaker closes.

use crate::errors::PoolError;
use crate::manager::ProtocolManager;
use crate::metrics::{
    POINTS_PUBLISHED_TOTAL, POLLS_FAILED_TOTAL, POLLS_SKIPPED_TOTAL, POLLS_TOTAL, POLL_DURATION,
};
use crate::model::{DataPoint, Device, Protocol, Quality};
use crate::registry::SharedRegistry;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::PollingConfig;

#[derive(Default)]
struct TagStats {
    reads_total: u64,
    bad_total: u64,
}

/// Per-device counters; atomics so the hot path takes no lock
#[derive(Default)]
pub struct DeviceStats {
    polls_total: AtomicU64,
    polls_failed: AtomicU64,
    polls_skipped: AtomicU64,
    last_duration_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
    tags: Mutex<HashMap<String, TagStats>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatsSnapshot {
    pub device_id: String,
    pub polls_total: u64,
    pub polls_failed: u64,
    pub polls_skipped: u64,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub tags: Vec<TagStatsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagStatsSnapshot {
    pub tag_id: String,
    pub reads_total: u64,
    pub bad_total: u64,
}

pub struct Scheduler {
    manager: Arc<ProtocolManager>,
    registry: SharedRegistry,
    config: PollingConfig,
    workers: Arc<Semaphore>,
    publish_tx: mpsc::Sender<DataPoint>,
    stats: Mutex<HashMap<String, Arc<DeviceStats>>>,
    reload: Notify,
}

impl Scheduler {
    pub fn new(
        manager: Arc<ProtocolManager>,
        registry: SharedRegistry,
        config: PollingConfig,
        publish_tx: mpsc::Sender<DataPoint>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_count));
        Self {
            manager,
            registry,
            config,
            workers,
            publish_tx,
            stats: Mutex::new(HashMap::new()),
            reload: Notify::new(),
        }
    }

    /// Re-read the registry snapshot and restart the device tickers
    pub fn notify_reload(&self) {
        self.reload.notify_one();
    }

    /// Drive all device tickers until `shutdown` fires, then drain in-flight
    /// polls for up to `shutdown_timeout`
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let snapshot = self.registry.snapshot();
            let generation = CancellationToken::new();
            let tracker = TaskTracker::new();

            let mut ticking = 0usize;
            for device in snapshot.enabled_devices() {
                // subscription-mode devices push data changes themselves
                if device.protocol == Protocol::Opcua && device.enable_subscriptions {
                    continue;
                }
                ticking += 1;
                let stats = self.device_stats(&device.id);
                tracker.spawn(self.clone().tick_device(
                    device,
                    stats,
                    generation.clone(),
                    tracker.clone(),
                ));
            }
            info!(device_count = ticking, "Scheduler generation started");

            tokio::select! {
                _ = shutdown.cancelled() => {
                    generation.cancel();
                    tracker.close();
                    let drain = Duration::from_secs(self.config.shutdown_timeout_secs);
                    if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
                        warn!("Shutdown drain timed out with polls still in flight");
                    }
                    info!("Scheduler stopped");
                    return;
                }
                _ = self.reload.notified() => {
                    generation.cancel();
                    tracker.close();
                    let _ = tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await;
                    info!("Scheduler restarting with reloaded registry");
                }
            }
        }
    }

    /// Ticker loop for one device
    async fn tick_device(
        self: Arc<Self>,
        device: Arc<Device>,
        stats: Arc<DeviceStats>,
        generation: CancellationToken,
        tracker: TaskTracker,
    ) {
        let period = Duration::from_millis(device.poll_interval_ms);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=period.as_millis() as u64 / 10));
        let mut ticker = interval_at(Instant::now() + jitter, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = generation.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.workers.clone().try_acquire_owned() {
                Err(_) => {
                    // back-pressure rule: never queue a tick
                    stats.polls_skipped.fetch_add(1, Ordering::Relaxed);
                    POLLS_SKIPPED_TOTAL.with_label_values(&[&device.id]).inc();
                    debug!(device_id = %device.id, "All poll workers busy, tick skipped");
                }
                Ok(permit) => {
                    let scheduler = self.clone();
                    let device = device.clone();
                    let stats = stats.clone();
                    tracker.spawn(async move {
                        scheduler.poll_device(&device, &stats).await;
                        drop(permit);
                    });
                }
            }
        }
    }

    async fn poll_device(&self, device: &Arc<Device>, stats: &DeviceStats) {
        stats.polls_total.fetch_add(1, Ordering::Relaxed);
        POLLS_TOTAL.with_label_values(&[&device.id]).inc();
        let started = std::time::Instant::now();

        for chunk in device.tags.chunks(self.config.batch_size.max(1)) {
            match self.manager.read_tags(device, chunk).await {
                Ok(points) => {
                    self.record_tag_reads(stats, &points);
                    for point in points {
                        POINTS_PUBLISHED_TOTAL.with_label_values(&[&device.id]).inc();
                        if self.publish_tx.send(point).await.is_err() {
                            warn!(device_id = %device.id, "Publisher channel closed, dropping poll output");
                            return;
                        }
                    }
                    *stats.last_success.lock().expect("stats lock poisoned") = Some(Utc::now());
                }
                Err(e) if e.is_rejection() => {
                    // the pool already counted it; a reject is not a failure
                    debug!(device_id = %device.id, reason = %e, "Poll rejected");
                }
                Err(e) => {
                    stats.polls_failed.fetch_add(1, Ordering::Relaxed);
                    POLLS_FAILED_TOTAL.with_label_values(&[&device.id]).inc();
                    *stats.last_error.lock().expect("stats lock poisoned") = Some(e.to_string());
                    warn!(device_id = %device.id, error = %e, "Poll failed");
                    break;
                }
            }
        }

        let elapsed = started.elapsed();
        stats
            .last_duration_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        POLL_DURATION
            .with_label_values(&[&device.id])
            .observe(elapsed.as_secs_f64());
    }

    fn record_tag_reads(&self, stats: &DeviceStats, points: &[DataPoint]) {
        let mut tags = stats.tags.lock().expect("stats lock poisoned");
        for point in points {
            let entry = tags.entry(point.tag_id.clone()).or_default();
            entry.reads_total += 1;
            if point.quality != Quality::Good {
                entry.bad_total += 1;
            }
        }
    }

    fn device_stats(&self, device_id: &str) -> Arc<DeviceStats> {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceStats::default()))
            .clone()
    }

    /// Snapshot for the `/status` endpoint
    pub fn stats_snapshot(&self) -> Vec<DeviceStatsSnapshot> {
        let stats = self.stats.lock().expect("stats lock poisoned");
        let mut out: Vec<DeviceStatsSnapshot> = stats
            .iter()
            .map(|(device_id, s)| {
                let tags = s
                    .tags
                    .lock()
                    .expect("stats lock poisoned")
                    .iter()
                    .map(|(tag_id, t)| TagStatsSnapshot {
                        tag_id: tag_id.clone(),
                        reads_total: t.reads_total,
                        bad_total: t.bad_total,
                    })
                    .collect();
                DeviceStatsSnapshot {
                    device_id: device_id.clone(),
                    polls_total: s.polls_total.load(Ordering::Relaxed),
                    polls_failed: s.polls_failed.load(Ordering::Relaxed),
                    polls_skipped: s.polls_skipped.load(Ordering::Relaxed),
                    last_duration_ms: s.last_duration_ms.load(Ordering::Relaxed),
                    last_error: s.last_error.lock().expect("stats lock poisoned").clone(),
                    last_success: *s.last_success.lock().expect("stats lock poisoned"),
                    tags,
                }
            })
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }
}
