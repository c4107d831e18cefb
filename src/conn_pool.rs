//! Connection pool, one per protocol
//!
//! Multiplexes operations across a bounded set of device connections. One
//! client per device address; operations on the same connection are
//! serialized with a per-connection mutex because several of the protocols
//! (Modbus TCP on a single unit, S7, the OPC UA secure channel) do not
//! tolerate interleaved requests on one socket. The pool's circuit breaker
//! wraps every call; while open, calls fail immediately with
//! `PoolError::CircuitOpen` and never reach a device.

use crate::adapters::{ProtocolAdapter, ProtocolError};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::ProtocolPoolConfig;
use crate::errors::PoolError;
use crate::metrics::{CIRCUIT_OPEN_REJECTIONS_TOTAL, CONNECTION_ERRORS_TOTAL, POOL_EXHAUSTED_TOTAL};
use crate::model::{DataPoint, Device, Tag, TagValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds a disconnected adapter for a device; injected so tests can swap
/// the wire protocols out
pub type AdapterFactory =
    Box<dyn Fn(Arc<Device>) -> Result<Box<dyn ProtocolAdapter>, ProtocolError> + Send + Sync>;

struct PooledConnection {
    adapter: Mutex<Box<dyn ProtocolAdapter>>,
    created_at: Instant,
    last_used: std::sync::Mutex<Instant>,
    in_use: AtomicBool,
    consecutive_failures: AtomicU32,
    last_success: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl PooledConnection {
    fn new(adapter: Box<dyn ProtocolAdapter>) -> Self {
        Self {
            adapter: Mutex::new(adapter),
            created_at: Instant::now(),
            last_used: std::sync::Mutex::new(Instant::now()),
            in_use: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_success: std::sync::Mutex::new(None),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("last_used lock poisoned")
            .elapsed()
    }

    fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_success.lock().expect("last_success lock poisoned") = Some(Utc::now());
    }

    fn mark_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub address: String,
    pub in_use: bool,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub protocol: String,
    pub connections: Vec<ConnectionStats>,
    pub breaker_state: String,
    pub breaker_trips: u64,
}

pub struct ConnectionPool {
    label: &'static str,
    config: ProtocolPoolConfig,
    factory: AdapterFactory,
    breaker: CircuitBreaker,
    clients: RwLock<HashMap<String, Arc<PooledConnection>>>,
    slot_freed: Notify,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(label: &'static str, config: ProtocolPoolConfig, factory: AdapterFactory) -> Self {
        let breaker = CircuitBreaker::new(Duration::from_secs(30));
        Self {
            label,
            config,
            factory,
            breaker,
            clients: RwLock::new(HashMap::new()),
            slot_freed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub async fn read_tags(
        &self,
        device: &Arc<Device>,
        tags: &[Tag],
    ) -> Result<Vec<DataPoint>, PoolError> {
        self.check_admission()?;
        let conn = self.lease(device).await?;

        conn.in_use.store(true, Ordering::Relaxed);
        let mut adapter = conn.adapter.lock().await;
        let result = match self.ensure_connected(&mut adapter, device).await {
            Err(e) => Err(e),
            Ok(()) => match timeout(
                self.config.connection_timeout(),
                adapter.read_tags(device, tags),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout),
            },
        };
        if matches!(result, Err(ProtocolError::Timeout)) {
            // a late response would desync the framing; start fresh
            let _ = adapter.close().await;
        }
        drop(adapter);
        conn.in_use.store(false, Ordering::Relaxed);
        conn.touch();

        self.settle(&conn, result)
    }

    pub async fn write_tag(
        &self,
        device: &Arc<Device>,
        tag: &Tag,
        value: &TagValue,
    ) -> Result<(), PoolError> {
        self.check_admission()?;
        let conn = self.lease(device).await?;

        conn.in_use.store(true, Ordering::Relaxed);
        let mut adapter = conn.adapter.lock().await;
        let result = match self.ensure_connected(&mut adapter, device).await {
            Err(e) => Err(e),
            Ok(()) => match timeout(
                self.config.connection_timeout(),
                adapter.write_tag(device, tag, value),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout),
            },
        };
        if matches!(result, Err(ProtocolError::Timeout)) {
            let _ = adapter.close().await;
        }
        drop(adapter);
        conn.in_use.store(false, Ordering::Relaxed);
        conn.touch();

        self.settle(&conn, result)
    }

    async fn ensure_connected(
        &self,
        adapter: &mut Box<dyn ProtocolAdapter>,
        device: &Arc<Device>,
    ) -> Result<(), ProtocolError> {
        if adapter.is_connected() {
            return Ok(());
        }
        self.connect_with_retry(adapter, device).await
    }

    fn check_admission(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PoolError::Closed);
        }
        if !self.breaker.allow() {
            CIRCUIT_OPEN_REJECTIONS_TOTAL
                .with_label_values(&[self.label])
                .inc();
            return Err(PoolError::CircuitOpen);
        }
        Ok(())
    }

    /// Book the breaker outcome and translate the error
    fn settle<T>(
        &self,
        conn: &PooledConnection,
        result: Result<T, ProtocolError>,
    ) -> Result<T, PoolError> {
        match result {
            Ok(value) => {
                self.breaker.record_success();
                conn.mark_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.breaker.record_failure();
                    let failures = conn.mark_failure();
                    CONNECTION_ERRORS_TOTAL
                        .with_label_values(&[self.label, e.category().as_str()])
                        .inc();
                    warn!(
                        protocol = self.label,
                        consecutive_failures = failures,
                        error = %e,
                        "Connection operation failed"
                    );
                } else {
                    // the device answered; the request itself was wrong
                    self.breaker.record_success();
                }
                Err(PoolError::Protocol(e))
            }
        }
    }

    async fn connect_with_retry(
        &self,
        adapter: &mut Box<dyn ProtocolAdapter>,
        device: &Arc<Device>,
    ) -> Result<(), ProtocolError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_err = ProtocolError::NotConnected;
        for attempt in 1..=attempts {
            match adapter.connect().await {
                Ok(()) => {
                    debug!(protocol = self.label, device_id = %device.id, attempt, "Connected");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let delay = Duration::from_millis(
                        (self.config.retry_delay_ms << (attempt - 1).min(6)).min(5000),
                    );
                    debug!(
                        protocol = self.label,
                        device_id = %device.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed, backing off"
                    );
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// One client per device address; waits up to `connection_timeout` for a
    /// slot when the pool is at `max_connections`
    async fn lease(&self, device: &Arc<Device>) -> Result<Arc<PooledConnection>, PoolError> {
        let key = device.address_key();
        let deadline = tokio::time::Instant::now() + self.config.connection_timeout();

        loop {
            {
                let clients = self.clients.read().await;
                if let Some(conn) = clients.get(&key) {
                    return Ok(conn.clone());
                }
            }
            {
                let mut clients = self.clients.write().await;
                if let Some(conn) = clients.get(&key) {
                    return Ok(conn.clone());
                }
                if clients.len() < self.config.max_connections {
                    let adapter = (self.factory)(device.clone())?;
                    let conn = Arc::new(PooledConnection::new(adapter));
                    clients.insert(key.clone(), conn.clone());
                    debug!(protocol = self.label, address = %key, total = clients.len(), "Opened pool slot");
                    return Ok(conn);
                }
            }
            if tokio::time::timeout_at(deadline, self.slot_freed.notified())
                .await
                .is_err()
            {
                POOL_EXHAUSTED_TOTAL.with_label_values(&[self.label]).inc();
                return Err(PoolError::PoolExhausted);
            }
        }
    }

    /// Close connections unused for longer than `idle_timeout`
    async fn reap_idle(&self) {
        let idle_timeout = self.config.idle_timeout();
        let stale: Vec<(String, Arc<PooledConnection>)> = {
            let mut clients = self.clients.write().await;
            let keys: Vec<String> = clients
                .iter()
                .filter(|(_, c)| !c.in_use.load(Ordering::Relaxed) && c.idle_for() > idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| clients.remove(&k).map(|c| (k, c)))
                .collect()
        };
        for (key, conn) in stale {
            let mut adapter = conn.adapter.lock().await;
            let _ = adapter.close().await;
            info!(protocol = self.label, address = %key, "Reaped idle connection");
            self.slot_freed.notify_waiters();
        }
    }

    /// Ping idle connections; a failed ping closes the client so the next
    /// lease reconnects
    async fn health_check(&self) {
        let conns: Vec<(String, Arc<PooledConnection>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .map(|(k, c)| (k.clone(), c.clone()))
                .collect()
        };
        for (key, conn) in conns {
            // skip busy connections; they are proving themselves already
            let Ok(mut adapter) = conn.adapter.try_lock() else {
                continue;
            };
            if !adapter.is_connected() {
                continue;
            }
            if let Err(e) = adapter.ping().await {
                warn!(protocol = self.label, address = %key, error = %e, "Health check failed, closing connection");
                let _ = adapter.close().await;
                conn.mark_failure();
            }
        }
    }

    /// Spawn the idle reaper and health checker loops
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let reaper = {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            let period = (pool.config.idle_timeout() / 4).max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => pool.reap_idle().await,
                    }
                }
            })
        };
        let health = {
            let pool = self.clone();
            let period = pool.config.health_check_period();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => pool.health_check().await,
                    }
                }
            })
        };
        vec![reaper, health]
    }

    pub async fn stats(&self) -> PoolStats {
        let clients = self.clients.read().await;
        let connections = clients
            .iter()
            .map(|(key, c)| ConnectionStats {
                address: key.clone(),
                in_use: c.in_use.load(Ordering::Relaxed),
                age_secs: c.created_at.elapsed().as_secs(),
                idle_secs: c.idle_for().as_secs(),
                consecutive_failures: c.consecutive_failures.load(Ordering::Relaxed),
                last_success: *c.last_success.lock().expect("last_success lock poisoned"),
            })
            .collect();
        PoolStats {
            protocol: self.label.to_string(),
            connections,
            breaker_state: self.breaker.state().as_str().to_string(),
            breaker_trips: self.breaker.trips_total(),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Close every connection. Takes the exclusive lock because it mutates
    /// the client map.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let drained: Vec<(String, Arc<PooledConnection>)> = {
            let mut clients = self.clients.write().await;
            clients.drain().collect()
        };
        for (key, conn) in drained {
            let mut adapter = conn.adapter.lock().await;
            if let Err(e) = adapter.close().await {
                warn!(protocol = self.label, address = %key, error = %e, "Error closing connection");
            }
        }
        info!(protocol = self.label, "Connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Protocol, Quality};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct MockAdapter {
        connected: bool,
        fail_reads: Arc<AtomicUsize>,
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProtocolAdapter for MockAdapter {
        async fn connect(&mut self) -> Result<(), ProtocolError> {
            self.connected = true;
            Ok(())
        }

        async fn read_tags(
            &mut self,
            device: &Device,
            tags: &[Tag],
        ) -> Result<Vec<DataPoint>, ProtocolError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.fail_reads.load(Ordering::SeqCst) > 0 {
                self.fail_reads.fetch_sub(1, Ordering::SeqCst);
                return Err(ProtocolError::ConnectionLost("mock".into()));
            }
            Ok(tags
                .iter()
                .map(|t| DataPoint {
                    device_id: device.id.clone(),
                    tag_id: t.id.clone(),
                    topic: t.topic(&device.uns_prefix),
                    value: Some(1.0),
                    quality: Quality::Good,
                    ts: Utc::now(),
                    ..Default::default()
                })
                .collect())
        }

        async fn write_tag(
            &mut self,
            _device: &Device,
            _tag: &Tag,
            _value: &TagValue,
        ) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ProtocolError> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn protocol_name(&self) -> &'static str {
            "mock"
        }
    }

    fn mock_factory(
        fail_reads: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    ) -> AdapterFactory {
        Box::new(move |_device| {
            Ok(Box::new(MockAdapter {
                connected: false,
                fail_reads: fail_reads.clone(),
                concurrent: Arc::new(AtomicUsize::new(0)),
                max_concurrent: max_concurrent.clone(),
            }) as Box<dyn ProtocolAdapter>)
        })
    }

    fn device(id: &str, host: &str) -> Arc<Device> {
        Arc::new(Device {
            id: id.to_string(),
            name: id.to_string(),
            protocol: Protocol::ModbusTcp,
            host: Some(host.to_string()),
            port: Some(502),
            serial_port: None,
            baud_rate: None,
            endpoint_url: None,
            unit_id: Some(1),
            rack: None,
            slot: None,
            security_mode: None,
            security_policy: None,
            username: None,
            password: None,
            enable_subscriptions: false,
            poll_interval_ms: 1000,
            uns_prefix: "plant/line/dev".to_string(),
            enabled: true,
            tags: vec![tag()],
            created_at: None,
            updated_at: None,
        })
    }

    fn tag() -> Tag {
        Tag {
            id: "t1".to_string(),
            name: "Temperature".to_string(),
            address: "40001".to_string(),
            data_type: DataType::Uint16,
            byte_order: None,
            scale: None,
            offset: None,
            clamp_min: None,
            clamp_max: None,
            deadband_absolute: None,
            deadband_percent: None,
            unit: None,
            custom_topic: None,
            writable: true,
        }
    }

    fn pool_config() -> ProtocolPoolConfig {
        ProtocolPoolConfig {
            max_connections: 2,
            idle_timeout_secs: 300,
            health_check_period_secs: 30,
            connection_timeout_secs: 1,
            retry_attempts: 1,
            retry_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_read_through_pool() {
        let pool = ConnectionPool::new(
            "modbus",
            pool_config(),
            mock_factory(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        );
        let dev = device("plc-001", "10.0.0.1");
        let points = pool.read_tags(&dev, &dev.tags).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].quality, Quality::Good);
    }

    #[tokio::test]
    async fn test_one_client_per_address() {
        let pool = ConnectionPool::new(
            "modbus",
            pool_config(),
            mock_factory(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        );
        let dev = device("plc-001", "10.0.0.1");
        pool.read_tags(&dev, &dev.tags).await.unwrap();
        pool.read_tags(&dev, &dev.tags).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.connections.len(), 1);
    }

    #[tokio::test]
    async fn test_same_device_ops_serialized() {
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(ConnectionPool::new(
            "modbus",
            pool_config(),
            mock_factory(Arc::new(AtomicUsize::new(0)), max_concurrent.clone()),
        ));
        let dev = device("plc-001", "10.0.0.1");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let dev = dev.clone();
            handles.push(tokio::spawn(async move {
                pool.read_tags(&dev, &dev.tags).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let mut config = pool_config();
        config.max_connections = 1;
        let pool = ConnectionPool::new(
            "modbus",
            config,
            mock_factory(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        );
        let dev1 = device("plc-001", "10.0.0.1");
        let dev2 = device("plc-002", "10.0.0.2");

        pool.read_tags(&dev1, &dev1.tags).await.unwrap();
        let result = pool.read_tags(&dev2, &dev2.tags).await;
        assert!(matches!(result, Err(PoolError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_rejects() {
        let fail = Arc::new(AtomicUsize::new(100));
        let pool = ConnectionPool::new(
            "modbus",
            pool_config(),
            mock_factory(fail, Arc::new(AtomicUsize::new(0))),
        );
        let dev = device("plc-001", "10.0.0.1");

        for _ in 0..5 {
            let result = pool.read_tags(&dev, &dev.tags).await;
            assert!(matches!(result, Err(PoolError::Protocol(_))));
        }
        assert_eq!(pool.breaker_state(), BreakerState::Open);

        // while open, the call never reaches the adapter
        let result = pool.read_tags(&dev, &dev.tags).await;
        assert!(matches!(result, Err(PoolError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_close_rejects_new_work() {
        let pool = ConnectionPool::new(
            "modbus",
            pool_config(),
            mock_factory(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        );
        let dev = device("plc-001", "10.0.0.1");
        pool.read_tags(&dev, &dev.tags).await.unwrap();
        pool.close().await;
        let result = pool.read_tags(&dev, &dev.tags).await;
        assert!(matches!(result, Err(PoolError::Closed)));
        assert!(pool.stats().await.connections.is_empty());
    }

    #[tokio::test]
    async fn test_idle_reaper_removes_stale() {
        let mut config = pool_config();
        config.idle_timeout_secs = 0; // everything is immediately stale
        let pool = ConnectionPool::new(
            "modbus",
            config,
            mock_factory(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        );
        let dev = device("plc-001", "10.0.0.1");
        pool.read_tags(&dev, &dev.tags).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.reap_idle().await;
        assert!(pool.stats().await.connections.is_empty());
    }
}
