//! Ingestion MQTT subscriber
//!
//! Joins the `$share/<group>/<pattern>` shared subscription at QoS 1 so
//! multiple ingestion instances load-balance the telemetry stream. Parsed
//! points are forwarded into the bounded batcher channel with a blocking
//! send: when the channel is full the event loop stalls, the broker stops
//! getting acks, and QoS 1 redelivery carries the back-pressure upstream.

use crate::config::{IngestionConfig, MqttConfig};
use crate::metrics::{INGEST_CHANNEL_DEPTH, MQTT_RECONNECTS_TOTAL, PARSE_ERRORS_TOTAL};
use crate::model::DataPoint;
use crate::publisher::qos_from_u8;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Parse one telemetry message; counts and discards malformed payloads
pub fn to_point(publish: &Publish) -> Option<DataPoint> {
    match DataPoint::from_payload(&publish.topic, &publish.payload) {
        Ok(point) => Some(point),
        Err(e) => {
            PARSE_ERRORS_TOTAL.inc();
            debug!(topic = %publish.topic, error = %e, "Discarding unparsable payload");
            None
        }
    }
}

pub struct Subscriber {
    mqtt: MqttConfig,
    ingestion: IngestionConfig,
}

impl Subscriber {
    pub fn new(mqtt: MqttConfig, ingestion: IngestionConfig) -> Self {
        Self { mqtt, ingestion }
    }

    fn subscription_filter(&self) -> String {
        format!(
            "$share/{}/{}",
            self.ingestion.shared_group, self.ingestion.topic_pattern
        )
    }

    /// Consume the shared subscription until shutdown, forwarding parsed
    /// points into `tx`
    pub async fn run(
        self,
        tx: mpsc::Sender<DataPoint>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let url = Url::parse(&self.mqtt.broker_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("broker_url has no host"))?
            .to_string();
        let port = url.port().unwrap_or(1883);

        let mut options = MqttOptions::new(self.mqtt.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(self.mqtt.keepalive_secs));
        options.set_clean_session(self.mqtt.clean_session);
        if let (Some(user), Some(pass)) = (&self.mqtt.username, &self.mqtt.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let filter = self.subscription_filter();
        let qos = qos_from_u8(1);
        let capacity = self.ingestion.channel_capacity;

        let mut consecutive_errors = 0u32;
        let max_backoff = Duration::from_secs(self.mqtt.reconnect_delay_secs.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = client.disconnect().await;
                    info!("Subscriber stopped");
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        consecutive_errors = 0;
                        info!(filter = %filter, "Connected, joining shared subscription");
                        if let Err(e) = client.subscribe(&filter, qos).await {
                            warn!(error = %e, "Subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(point) = to_point(&publish) {
                            // blocking send: back-pressure to the broker
                            if tx.send(point).await.is_err() {
                                warn!("Batcher channel closed, stopping subscriber");
                                return Ok(());
                            }
                            INGEST_CHANNEL_DEPTH
                                .set((capacity - tx.capacity()) as f64);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error");
                        MQTT_RECONNECTS_TOTAL.inc();
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        let backoff = Duration::from_secs(1u64 << consecutive_errors.min(6))
                            .min(max_backoff);
                        tokio::time::sleep(backoff).await;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;
    use rumqttc::QoS;

    #[test]
    fn test_to_point_parses_telemetry() {
        let payload = b"{\"v\": 84.5, \"u\": \"\xc2\xb0C\", \"q\": \"good\", \"ts\": 1700000000000, \"device_id\": \"plc-001\", \"tag_id\": \"t1\"}";
        let publish = Publish::new(
            "plant1/line2/plc1/Temperature",
            QoS::AtLeastOnce,
            payload.to_vec(),
        );
        let point = to_point(&publish).unwrap();
        assert_eq!(point.topic, "plant1/line2/plc1/Temperature");
        assert_eq!(point.value, Some(84.5));
        assert_eq!(point.quality, Quality::Good);
        assert_eq!(point.device_id, "plc-001");
    }

    #[test]
    fn test_to_point_counts_garbage() {
        let before = PARSE_ERRORS_TOTAL.get();
        let publish = Publish::new("some/topic", QoS::AtLeastOnce, b"not json".to_vec());
        assert!(to_point(&publish).is_none());
        assert!(PARSE_ERRORS_TOTAL.get() > before);
    }

    #[test]
    fn test_subscription_filter_shape() {
        let subscriber = Subscriber::new(
            MqttConfig::default(),
            IngestionConfig {
                shared_group: "ingestion".to_string(),
                topic_pattern: "plant1/#".to_string(),
                ..IngestionConfig::default()
            },
        );
        assert_eq!(subscriber.subscription_filter(), "$share/ingestion/plant1/#");
    }
}
