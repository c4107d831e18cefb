//! MQTT publisher
//!
//! One persistent broker connection (clean_session = false) multiplexing
//! every outbound publish: telemetry points at QoS 1 and command responses
//! at QoS 2. Incoming publishes (the command topic space) are forwarded to
//! whoever holds the incoming receiver. While the broker is unreachable,
//! outbound points land in a bounded local buffer (memory ring with optional
//! disk spillover) and drain FIFO on reconnect; when both tiers are full the
//! oldest point is dropped and counted.
//!
//! The publisher is the unique releaser of pooled DataPoints: a point is
//! serialized exactly once and returned to the pool immediately after.

use crate::config::MqttConfig;
use crate::metrics::{BUFFERED_DROPPED_TOTAL, MQTT_RECONNECTS_TOTAL, PUBLISHER_BUFFER_SIZE};
use crate::model::DataPoint;
use crate::point_pool::PointPool;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Non-telemetry outbound publish (command responses)
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Producer-side endpoints handed to the scheduler and command handler
pub struct PublisherChannels {
    pub points_tx: mpsc::Sender<DataPoint>,
    pub raw_tx: mpsc::Sender<RawMessage>,
    pub incoming_rx: mpsc::Receiver<Publish>,
}

/// Shared client for subscriptions from other components
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
}

impl MqttHandle {
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), rumqttc::ClientError> {
        self.client.subscribe(topic, qos).await
    }
}

struct BufferEntry {
    topic: String,
    payload: Vec<u8>,
    queued_at: Instant,
}

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    topic: String,
    payload: String,
    age_secs: u64,
}

/// Bounded store-and-forward buffer: memory ring first, disk second
struct LocalBuffer {
    memory: VecDeque<BufferEntry>,
    memory_limit: usize,
    disk_path: Option<PathBuf>,
    disk_limit: usize,
    disk_count: usize,
    ttl: Duration,
}

impl LocalBuffer {
    fn new(config: &crate::config::BufferConfig) -> Self {
        let disk_path = if config.disk_enabled {
            let path = PathBuf::from(&config.disk_path);
            if let Err(e) = std::fs::create_dir_all(&path) {
                error!(path = %path.display(), error = %e, "Cannot create buffer spill directory, disk tier disabled");
                None
            } else {
                Some(path.join("publish-spill.jsonl"))
            }
        } else {
            None
        };
        Self {
            memory: VecDeque::with_capacity(config.memory_limit.min(4096)),
            memory_limit: config.memory_limit,
            disk_path,
            disk_limit: config.disk_limit,
            disk_count: 0,
            ttl: Duration::from_secs(config.message_ttl_secs),
        }
    }

    fn len(&self) -> usize {
        self.memory.len() + self.disk_count
    }

    fn push(&mut self, topic: String, payload: Vec<u8>) {
        if self.memory.len() >= self.memory_limit {
            // spill the oldest memory entry to keep FIFO order across tiers
            let oldest = self.memory.pop_front().expect("memory limit > 0");
            if !self.spill(oldest) {
                BUFFERED_DROPPED_TOTAL.inc();
            }
        }
        self.memory.push_back(BufferEntry {
            topic,
            payload,
            queued_at: Instant::now(),
        });
        PUBLISHER_BUFFER_SIZE.set(self.len() as f64);
    }

    /// Move one entry to the disk tier; false means it was dropped
    fn spill(&mut self, entry: BufferEntry) -> bool {
        let Some(path) = &self.disk_path else {
            return false;
        };
        if self.disk_count >= self.disk_limit {
            return false;
        }
        let Ok(payload) = String::from_utf8(entry.payload) else {
            return false;
        };
        let line = DiskEntry {
            topic: entry.topic,
            payload,
            age_secs: entry.queued_at.elapsed().as_secs(),
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| {
                // serde-derived over plain fields; cannot fail
                let json = serde_json::to_string(&line).unwrap_or_default();
                writeln!(f, "{json}")
            });
        match result {
            Ok(()) => {
                self.disk_count += 1;
                true
            }
            Err(e) => {
                warn!(error = %e, "Buffer spill write failed");
                false
            }
        }
    }

    /// Take everything in FIFO order (disk tier first, it holds the oldest),
    /// dropping entries past their TTL
    fn drain(&mut self) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.len());
        if let Some(path) = &self.disk_path {
            if self.disk_count > 0 {
                match std::fs::File::open(path) {
                    Ok(file) => {
                        for line in std::io::BufReader::new(file).lines().map_while(Result::ok) {
                            match serde_json::from_str::<DiskEntry>(&line) {
                                Ok(entry) if entry.age_secs < self.ttl.as_secs() => {
                                    out.push((entry.topic, entry.payload.into_bytes()));
                                }
                                Ok(_) => BUFFERED_DROPPED_TOTAL.inc(),
                                Err(_) => BUFFERED_DROPPED_TOTAL.inc(),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Cannot read buffer spill file"),
                }
                let _ = std::fs::remove_file(path);
                self.disk_count = 0;
            }
        }
        let now = Instant::now();
        for entry in self.memory.drain(..) {
            if now.duration_since(entry.queued_at) < self.ttl {
                out.push((entry.topic, entry.payload));
            } else {
                BUFFERED_DROPPED_TOTAL.inc();
            }
        }
        PUBLISHER_BUFFER_SIZE.set(0.0);
        out
    }
}

pub struct Publisher {
    config: MqttConfig,
    points: Arc<PointPool>,
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    points_rx: mpsc::Receiver<DataPoint>,
    raw_rx: mpsc::Receiver<RawMessage>,
    incoming_tx: mpsc::Sender<Publish>,
    connected: Arc<AtomicBool>,
    buffer: LocalBuffer,
}

impl Publisher {
    pub fn new(
        config: MqttConfig,
        points: Arc<PointPool>,
    ) -> anyhow::Result<(Self, PublisherChannels)> {
        let url = Url::parse(&config.broker_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("broker_url has no host"))?
            .to_string();
        let port = url.port().unwrap_or(1883);

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        options.set_clean_session(config.clean_session);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (points_tx, points_rx) = mpsc::channel(4096);
        let (raw_tx, raw_rx) = mpsc::channel(256);
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);

        let buffer = LocalBuffer::new(&config.buffer);
        Ok((
            Self {
                config,
                points,
                client,
                eventloop,
                points_rx,
                raw_rx,
                incoming_tx,
                connected: Arc::new(AtomicBool::new(false)),
                buffer,
            },
            PublisherChannels {
                points_tx,
                raw_tx,
                incoming_rx,
            },
        ))
    }

    pub fn handle(&self) -> MqttHandle {
        MqttHandle {
            client: self.client.clone(),
        }
    }

    pub fn is_connected(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Drive the event loop and the outbound queues until shutdown
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut consecutive_errors = 0u32;
        let max_backoff = Duration::from_secs(self.config.reconnect_delay_secs.max(1));
        let default_qos = qos_from_u8(self.config.default_qos);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let parked = self.buffer.len();
                    if parked > 0 {
                        warn!(parked, "Shutting down with points still buffered");
                    }
                    let _ = self.client.disconnect().await;
                    info!("Publisher stopped");
                    return;
                }

                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        consecutive_errors = 0;
                        self.connected.store(true, Ordering::Relaxed);
                        info!("Connected to MQTT broker");
                        self.drain_buffer(default_qos).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if self.incoming_tx.try_send(publish).is_err() {
                            warn!("Incoming command queue full, message dropped for redelivery");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.connected.swap(false, Ordering::Relaxed) {
                            warn!(error = %e, "MQTT connection lost");
                        }
                        MQTT_RECONNECTS_TOTAL.inc();
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        let backoff = Duration::from_secs(1u64 << consecutive_errors.min(6))
                            .min(max_backoff);
                        debug!(backoff_secs = backoff.as_secs(), "Reconnect backoff");
                        tokio::time::sleep(backoff).await;
                    }
                },

                Some(point) = self.points_rx.recv() => {
                    self.publish_point(point, default_qos).await;
                }

                Some(raw) = self.raw_rx.recv() => {
                    if self.connected.load(Ordering::Relaxed) {
                        if let Err(e) = self
                            .client
                            .publish(raw.topic.clone(), raw.qos, false, raw.payload.clone())
                            .await
                        {
                            warn!(topic = %raw.topic, error = %e, "Response publish failed");
                        }
                    }
                    // command responses are not buffered; a late ack is useless
                }
            }
        }
    }

    async fn publish_point(&mut self, point: DataPoint, qos: QoS) {
        let topic = point.topic.clone();
        let payload = point.to_payload();
        // serialize once, then the point goes straight back to the pool
        self.points.release(point);

        if self.connected.load(Ordering::Relaxed) {
            if let Err(e) = self.client.publish(&topic, qos, false, payload.clone()).await {
                warn!(topic = %topic, error = %e, "Publish failed, buffering");
                self.buffer.push(topic, payload);
            }
        } else {
            self.buffer.push(topic, payload);
        }
    }

    async fn drain_buffer(&mut self, qos: QoS) {
        let entries = self.buffer.drain();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "Draining publish buffer");
        for (topic, payload) in entries {
            if let Err(e) = self.client.publish(&topic, qos, false, payload.clone()).await {
                warn!(topic = %topic, error = %e, "Drain publish failed, re-buffering");
                self.buffer.push(topic, payload);
                return;
            }
        }
    }
}
