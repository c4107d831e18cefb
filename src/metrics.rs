//! Prometheus metrics for both services
//!
//! Counters follow the names the dashboards alert on; rejection counters
//! (skips, circuit-open, buffer drops) are deliberately separate from
//! failure counters.

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // ---- gateway: polling ----

    pub static ref POLLS_TOTAL: CounterVec = register_counter_vec!(
        "polls_total",
        "Total poll attempts per device",
        &["device_id"]
    )
    .unwrap();

    pub static ref POLLS_FAILED_TOTAL: CounterVec = register_counter_vec!(
        "polls_failed_total",
        "Polls that failed with an adapter or pool error",
        &["device_id"]
    )
    .unwrap();

    pub static ref POLLS_SKIPPED_TOTAL: CounterVec = register_counter_vec!(
        "polls_skipped_total",
        "Ticks skipped because all poll workers were busy",
        &["device_id"]
    )
    .unwrap();

    pub static ref POLL_DURATION: HistogramVec = register_histogram_vec!(
        "poll_duration_seconds",
        "Wall time of one device poll",
        &["device_id"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]
    )
    .unwrap();

    pub static ref POINTS_PUBLISHED_TOTAL: CounterVec = register_counter_vec!(
        "points_published_total",
        "DataPoints handed to the MQTT publisher",
        &["device_id"]
    )
    .unwrap();

    // ---- gateway: pools ----

    pub static ref CIRCUIT_OPEN_REJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "circuit_open_rejections_total",
        "Calls rejected because the pool's circuit breaker was open",
        &["protocol"]
    )
    .unwrap();

    pub static ref POOL_EXHAUSTED_TOTAL: CounterVec = register_counter_vec!(
        "pool_exhausted_total",
        "Lease requests that timed out on a full connection pool",
        &["protocol"]
    )
    .unwrap();

    pub static ref CONNECTION_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "connection_errors_total",
        "Connection-level failures per protocol and error category",
        &["protocol", "category"]
    )
    .unwrap();

    // ---- gateway: commands ----

    pub static ref COMMANDS_TOTAL: CounterVec = register_counter_vec!(
        "commands_total",
        "Write commands by outcome",
        &["result"]
    )
    .unwrap();

    pub static ref COMMAND_DURATION: HistogramVec = register_histogram_vec!(
        "command_duration_seconds",
        "Dispatch latency of accepted write commands",
        &["device_id"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .unwrap();

    // ---- gateway: publisher ----

    pub static ref BUFFERED_DROPPED_TOTAL: Counter = register_counter!(
        "buffered_dropped_total",
        "Buffered points dropped because memory and disk buffers were full"
    )
    .unwrap();

    pub static ref PUBLISHER_BUFFER_SIZE: Gauge = register_gauge!(
        "publisher_buffer_size",
        "Points currently parked in the local publish buffer"
    )
    .unwrap();

    pub static ref MQTT_RECONNECTS_TOTAL: Counter = register_counter!(
        "mqtt_reconnects_total",
        "Broker reconnect attempts"
    )
    .unwrap();

    // ---- ingestion ----

    pub static ref PARSE_ERRORS_TOTAL: Counter = register_counter!(
        "parse_errors_total",
        "Telemetry payloads that failed to parse"
    )
    .unwrap();

    pub static ref INGEST_CHANNEL_DEPTH: Gauge = register_gauge!(
        "ingest_channel_depth",
        "Points waiting between the subscriber and the batcher"
    )
    .unwrap();

    pub static ref BATCHES_WRITTEN_TOTAL: Counter = register_counter!(
        "batches_written_total",
        "Batches committed to the time-series store"
    )
    .unwrap();

    pub static ref WRITE_ERRORS_TOTAL: Counter = register_counter!(
        "write_errors_total",
        "Batches dropped after exhausting write retries"
    )
    .unwrap();

    pub static ref DB_WRITE_LATENCY: HistogramVec = register_histogram_vec!(
        "db_write_duration_seconds",
        "Time taken to write one batch",
        &["path"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();

    pub static ref BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "batch_size",
        "Points per batch handed to a writer",
        &["trigger"],
        vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap();
}

/// Serves the Prometheus text endpoint on its own port
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(port = self.port, "Metrics server listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_once() {
        POLLS_TOTAL.with_label_values(&["plc-001"]).inc();
        POLLS_SKIPPED_TOTAL.with_label_values(&["plc-001"]).inc();
        BUFFERED_DROPPED_TOTAL.inc();
        assert!(POLLS_TOTAL.with_label_values(&["plc-001"]).get() >= 1.0);
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_text() {
        POLLS_TOTAL.with_label_values(&["plc-002"]).inc();
        let body = metrics_handler().await;
        assert!(body.contains("polls_total"));
    }
}
