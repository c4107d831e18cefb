//! Bidirectional command handler
//!
//! Subscribes to `$nexus/cmd/+/+/set` via a shared subscription so several
//! gateway instances can split the fleet without coordination: each instance
//! silently drops commands for devices it does not own, and the one owner
//! answers. Accepted commands acquire a write slot non-blockingly; when all
//! slots are busy the command is rejected immediately with a failure
//! response, never queued.

use crate::config::CommandConfig;
use crate::errors::PoolError;
use crate::manager::ProtocolManager;
use crate::metrics::{COMMANDS_TOTAL, COMMAND_DURATION};
use crate::model::{Command, CommandResponse, TagValue};
use crate::publisher::{qos_from_u8, MqttHandle, RawMessage};
use crate::registry::SharedRegistry;
use chrono::Utc;
use rumqttc::{Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Shared-subscription filter for the command topic space
pub const COMMAND_TOPIC_FILTER: &str = "$share/gateway/$nexus/cmd/+/+/set";

/// `$nexus/cmd/{device_id}/{tag_id}/set` → (device_id, tag_id)
pub fn parse_command_topic(topic: &str) -> Option<(&str, &str)> {
    let mut parts = topic.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("$nexus"), Some("cmd"), Some(device), Some(tag), Some("set"), None)
            if !device.is_empty() && !tag.is_empty() =>
        {
            Some((device, tag))
        }
        _ => None,
    }
}

/// Payload is either a raw JSON scalar or `{"value": ..., "request_id": ...}`
pub fn parse_command_payload(
    payload: &[u8],
) -> Result<(serde_json::Value, Option<String>), String> {
    let parsed: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| format!("malformed payload: {e}"))?;
    match parsed {
        serde_json::Value::Object(mut map) => {
            let value = map
                .remove("value")
                .ok_or_else(|| "object payload without \"value\"".to_string())?;
            if value.is_object() || value.is_array() {
                return Err("\"value\" must be a scalar".to_string());
            }
            let request_id = map
                .remove("request_id")
                .and_then(|v| v.as_str().map(|s| s.to_string()));
            Ok((value, request_id))
        }
        serde_json::Value::Array(_) => Err("array payloads are not valid commands".to_string()),
        scalar => Ok((scalar, None)),
    }
}

pub struct CommandHandler {
    registry: SharedRegistry,
    manager: Arc<ProtocolManager>,
    config: CommandConfig,
    write_slots: Arc<Semaphore>,
    responses: mpsc::Sender<RawMessage>,
    response_qos: QoS,
}

impl CommandHandler {
    pub fn new(
        registry: SharedRegistry,
        manager: Arc<ProtocolManager>,
        config: CommandConfig,
        responses: mpsc::Sender<RawMessage>,
        response_qos: QoS,
    ) -> Arc<Self> {
        let write_slots = Arc::new(Semaphore::new(config.max_concurrent_writes));
        Arc::new(Self {
            registry,
            manager,
            config,
            write_slots,
            responses,
            response_qos,
        })
    }

    pub async fn subscribe(&self, mqtt: &MqttHandle) -> anyhow::Result<()> {
        mqtt.subscribe(COMMAND_TOPIC_FILTER, qos_from_u8(1)).await?;
        info!(filter = COMMAND_TOPIC_FILTER, "Subscribed to command topics");
        Ok(())
    }

    /// Consume incoming command publishes until shutdown; in-flight writes
    /// are drained before returning
    pub async fn run(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<Publish>,
        shutdown: CancellationToken,
    ) {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                publish = incoming.recv() => match publish {
                    None => break,
                    Some(publish) => self.dispatch(publish, &tracker),
                }
            }
        }
        tracker.close();
        let _ = tokio::time::timeout(
            Duration::from_secs(self.config.write_timeout_secs),
            tracker.wait(),
        )
        .await;
        info!("Command handler stopped");
    }

    fn dispatch(self: &Arc<Self>, publish: Publish, tracker: &TaskTracker) {
        let Some((device_id, tag_id)) = parse_command_topic(&publish.topic) else {
            debug!(topic = %publish.topic, "Ignoring non-command topic");
            return;
        };
        let device_id = device_id.to_string();
        let tag_id = tag_id.to_string();

        // horizontal scale-out: not ours means some other instance answers
        let registry = self.registry.snapshot();
        let Some(device) = registry.device(&device_id) else {
            debug!(device_id = %device_id, "Command for device not in this instance, dropping");
            return;
        };

        let (value, request_id) = match parse_command_payload(&publish.payload) {
            Ok(parsed) => parsed,
            Err(error) => {
                COMMANDS_TOTAL.with_label_values(&["invalid"]).inc();
                self.respond(&device_id, &tag_id, CommandResponse {
                    success: false,
                    error: Some(error),
                    duration_ms: 0,
                    request_id: None,
                });
                return;
            }
        };
        let command = Command {
            device_id: device_id.clone(),
            tag_id: tag_id.clone(),
            value,
            request_id,
            received_at: Utc::now(),
        };

        // fail fast: no queue behind the write slots
        let permit = match self.write_slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                COMMANDS_TOTAL.with_label_values(&["rejected"]).inc();
                warn!(device_id = %device_id, "Write limit reached, command rejected");
                self.respond(&device_id, &tag_id, CommandResponse {
                    success: false,
                    error: Some("write limit reached".to_string()),
                    duration_ms: 0,
                    request_id: command.request_id,
                });
                return;
            }
        };

        let handler = self.clone();
        tracker.spawn(async move {
            handler.execute(device, command).await;
            drop(permit);
        });
    }

    async fn execute(&self, device: Arc<crate::model::Device>, command: Command) {
        let started = std::time::Instant::now();
        let request_id = command.request_id.clone();

        let result = self.run_write(&device, &command).await;
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                COMMANDS_TOTAL.with_label_values(&["success"]).inc();
                COMMAND_DURATION
                    .with_label_values(&[&command.device_id])
                    .observe(duration.as_secs_f64());
                self.respond(&command.device_id, &command.tag_id, CommandResponse {
                    success: true,
                    error: None,
                    duration_ms: duration.as_millis() as u64,
                    request_id,
                });
            }
            Err(error) => {
                COMMANDS_TOTAL.with_label_values(&["failed"]).inc();
                warn!(
                    device_id = %command.device_id,
                    tag_id = %command.tag_id,
                    error = %error,
                    "Command failed"
                );
                self.respond(&command.device_id, &command.tag_id, CommandResponse {
                    success: false,
                    error: Some(error),
                    duration_ms: duration.as_millis() as u64,
                    request_id,
                });
            }
        }
    }

    async fn run_write(
        &self,
        device: &Arc<crate::model::Device>,
        command: &Command,
    ) -> Result<(), String> {
        let tag = device
            .tag(&command.tag_id)
            .ok_or_else(|| format!("unknown tag {}", command.tag_id))?;
        if !tag.writable {
            return Err(format!("tag {} is not writable", tag.name));
        }
        let value = TagValue::coerce(&command.value, tag.data_type)?;

        let write = self.manager.write_tag(device, tag, &value);
        match tokio::time::timeout(
            Duration::from_secs(self.config.write_timeout_secs),
            write,
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(PoolError::CircuitOpen)) => Err("circuit breaker open".to_string()),
            Ok(Err(PoolError::PoolExhausted)) => Err("connection pool exhausted".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("write timed out".to_string()),
        }
    }

    fn respond(&self, device_id: &str, tag_id: &str, response: CommandResponse) {
        if !self.config.enable_acknowledgement {
            return;
        }
        // serde-derived over plain fields; cannot fail
        let payload = serde_json::to_vec(&response).unwrap_or_default();
        let message = RawMessage {
            topic: format!("$nexus/cmd/response/{device_id}/{tag_id}"),
            payload,
            qos: self.response_qos,
        };
        if self.responses.try_send(message).is_err() {
            warn!(device_id, tag_id, "Response channel full, ack dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ProtocolAdapter, ProtocolError};
    use crate::config::{Config, ProtocolPoolConfig};
    use crate::conn_pool::ConnectionPool;
    use crate::model::{DataPoint, DataType, Device, Protocol, Tag};
    use crate::registry;
    use async_trait::async_trait;

    struct WriteAdapter {
        connected: bool,
        delay: Duration,
    }

    #[async_trait]
    impl ProtocolAdapter for WriteAdapter {
        async fn connect(&mut self) -> Result<(), ProtocolError> {
            self.connected = true;
            Ok(())
        }

        async fn read_tags(
            &mut self,
            _device: &Device,
            _tags: &[Tag],
        ) -> Result<Vec<DataPoint>, ProtocolError> {
            Ok(vec![])
        }

        async fn write_tag(
            &mut self,
            _device: &Device,
            tag: &Tag,
            value: &TagValue,
        ) -> Result<(), ProtocolError> {
            tokio::time::sleep(self.delay).await;
            // reverse scaling happens in the real adapters; assert the typed
            // value arrived intact
            assert!(value.as_f64().is_some() || tag.data_type == DataType::String);
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

    fn test_device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            name: id.to_string(),
            protocol: Protocol::ModbusTcp,
            host: Some("10.0.0.9".to_string()),
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
            uns_prefix: "plant1/line2/plc1".to_string(),
            enabled: true,
            tags: vec![Tag {
                id: "Setpoint".to_string(),
                name: "Setpoint".to_string(),
                address: "40010".to_string(),
                data_type: DataType::Float32,
                byte_order: None,
                scale: Some(0.1),
                offset: None,
                clamp_min: None,
                clamp_max: None,
                deadband_absolute: None,
                deadband_percent: None,
                unit: None,
                custom_topic: None,
                writable: true,
            }],
            created_at: None,
            updated_at: None,
        }
    }

    fn handler_with(
        devices: Vec<Device>,
        max_writes: usize,
        write_delay: Duration,
    ) -> (Arc<CommandHandler>, mpsc::Receiver<RawMessage>) {
        let pool = Arc::new(ConnectionPool::new(
            "modbus",
            ProtocolPoolConfig {
                connection_timeout_secs: 5,
                retry_attempts: 1,
                retry_delay_ms: 1,
                ..ProtocolPoolConfig::default()
            },
            Box::new(move |_| {
                Ok(Box::new(WriteAdapter {
                    connected: false,
                    delay: write_delay,
                }) as Box<dyn ProtocolAdapter>)
            }),
        ));
        let manager = Arc::new(ProtocolManager::from_pools(vec![pool]));
        let shared = SharedRegistry::new(registry::validate(devices, 1000).unwrap());
        let (tx, rx) = mpsc::channel(64);
        let config = CommandConfig {
            max_concurrent_writes: max_writes,
            write_timeout_secs: 5,
            enable_acknowledgement: true,
        };
        (
            CommandHandler::new(shared, manager, config, tx, QoS::ExactlyOnce),
            rx,
        )
    }

    fn command_publish(topic: &str, payload: &str) -> Publish {
        Publish::new(topic, QoS::AtLeastOnce, payload.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_command_topic() {
        assert_eq!(
            parse_command_topic("$nexus/cmd/plc-001/Setpoint/set"),
            Some(("plc-001", "Setpoint"))
        );
        assert_eq!(parse_command_topic("$nexus/cmd/plc-001/set"), None);
        assert_eq!(parse_command_topic("$nexus/cmd/plc-001/Setpoint/get"), None);
        assert_eq!(parse_command_topic("plant1/line2/plc1/Temperature"), None);
        assert_eq!(parse_command_topic("$nexus/cmd/a/b/set/extra"), None);
    }

    #[test]
    fn test_parse_command_payload() {
        let (value, request_id) =
            parse_command_payload(br#"{"value": 75.5, "request_id": "abc"}"#).unwrap();
        assert_eq!(value, serde_json::json!(75.5));
        assert_eq!(request_id.as_deref(), Some("abc"));

        let (value, request_id) = parse_command_payload(b"42").unwrap();
        assert_eq!(value, serde_json::json!(42));
        assert_eq!(request_id, None);

        let (value, _) = parse_command_payload(b"true").unwrap();
        assert_eq!(value, serde_json::json!(true));

        assert!(parse_command_payload(b"{\"nope\": 1}").is_err());
        assert!(parse_command_payload(b"[1,2]").is_err());
        assert!(parse_command_payload(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_write_with_ack() {
        let (handler, mut responses) =
            handler_with(vec![test_device("plc-001")], 50, Duration::ZERO);
        let shutdown = CancellationToken::new();
        let (tx, incoming) = mpsc::channel(8);

        let run = tokio::spawn(handler.clone().run(incoming, shutdown.clone()));
        tx.send(command_publish(
            "$nexus/cmd/plc-001/Setpoint/set",
            r#"{"value": 75.5, "request_id": "abc"}"#,
        ))
        .await
        .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic, "$nexus/cmd/response/plc-001/Setpoint");
        assert_eq!(message.qos, QoS::ExactlyOnce);
        let response: CommandResponse = serde_json::from_slice(&message.payload).unwrap();
        assert!(response.success);
        assert_eq!(response.request_id.as_deref(), Some("abc"));

        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_dropped_silently() {
        let (handler, mut responses) =
            handler_with(vec![test_device("plc-001")], 50, Duration::ZERO);
        let shutdown = CancellationToken::new();
        let (tx, incoming) = mpsc::channel(8);

        let run = tokio::spawn(handler.clone().run(incoming, shutdown.clone()));
        tx.send(command_publish(
            "$nexus/cmd/plc-999/Setpoint/set",
            r#"{"value": 1}"#,
        ))
        .await
        .unwrap();

        // no response may be produced for a device this instance does not own
        let result = tokio::time::timeout(Duration::from_millis(200), responses.recv()).await;
        assert!(result.is_err());

        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_unwritable_tag_rejected() {
        let mut device = test_device("plc-001");
        device.tags[0].writable = false;
        let (handler, mut responses) = handler_with(vec![device], 50, Duration::ZERO);
        let shutdown = CancellationToken::new();
        let (tx, incoming) = mpsc::channel(8);

        let run = tokio::spawn(handler.clone().run(incoming, shutdown.clone()));
        tx.send(command_publish(
            "$nexus/cmd/plc-001/Setpoint/set",
            "75.5",
        ))
        .await
        .unwrap();

        let message = responses.recv().await.unwrap();
        let response: CommandResponse = serde_json::from_slice(&message.payload).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not writable"));

        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_write_slots_reject_immediately() {
        let (handler, mut responses) = handler_with(
            vec![test_device("plc-001")],
            1,
            Duration::from_millis(500),
        );
        let shutdown = CancellationToken::new();
        let (tx, incoming) = mpsc::channel(8);

        let run = tokio::spawn(handler.clone().run(incoming, shutdown.clone()));
        tx.send(command_publish(
            "$nexus/cmd/plc-001/Setpoint/set",
            r#"{"value": 1, "request_id": "first"}"#,
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(command_publish(
            "$nexus/cmd/plc-001/Setpoint/set",
            r#"{"value": 2, "request_id": "second"}"#,
        ))
        .await
        .unwrap();

        // the rejection arrives before the slow first write completes
        let message = responses.recv().await.unwrap();
        let response: CommandResponse = serde_json::from_slice(&message.payload).unwrap();
        assert!(!response.success);
        assert_eq!(response.request_id.as_deref(), Some("second"));
        assert!(response.error.unwrap().contains("write limit"));

        // the slow write still succeeds afterwards
        let message = responses.recv().await.unwrap();
        let response: CommandResponse = serde_json::from_slice(&message.payload).unwrap();
        assert!(response.success);
        assert_eq!(response.request_id.as_deref(), Some("first"));

        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_value_type_mismatch_rejected() {
        let (handler, mut responses) =
            handler_with(vec![test_device("plc-001")], 50, Duration::ZERO);
        let shutdown = CancellationToken::new();
        let (tx, incoming) = mpsc::channel(8);

        let run = tokio::spawn(handler.clone().run(incoming, shutdown.clone()));
        tx.send(command_publish(
            "$nexus/cmd/plc-001/Setpoint/set",
            r#"{"value": "not-a-number"}"#,
        ))
        .await
        .unwrap();

        let message = responses.recv().await.unwrap();
        let response: CommandResponse = serde_json::from_slice(&message.payload).unwrap();
        assert!(!response.success);

        shutdown.cancel();
        run.await.unwrap();
    }
}
