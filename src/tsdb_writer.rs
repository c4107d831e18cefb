//! Time-series bulk writer
//!
//! Streams batches into the `metrics` hypertable over the COPY protocol
//! (column order: time, topic, value, value_str, quality, metadata), with an
//! UNNEST bulk insert as the non-COPY fallback. Transient database errors
//! are retried with exponential backoff; on give-up the batch is dropped,
//! counted, and logged with its size and time range so it can be replayed
//! from the broker if needed. Writer tasks are independent: one stuck batch
//! never blocks the others.

use crate::batcher::Batch;
use crate::config::TsdbConfig;
use crate::errors::{is_transient_db_error, IngestError, IngestResult};
use crate::metrics::{BATCHES_WRITTEN_TOTAL, DB_WRITE_LATENCY, WRITE_ERRORS_TOTAL};
use crate::model::DataPoint;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backoff cap between write retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Escape a text value for the COPY text format
fn copy_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Structured metadata stored alongside each row
fn metadata_json(point: &DataPoint) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "device_id".to_string(),
        serde_json::Value::String(point.device_id.clone()),
    );
    map.insert(
        "tag_id".to_string(),
        serde_json::Value::String(point.tag_id.clone()),
    );
    if let Some(unit) = &point.unit {
        map.insert("unit".to_string(), serde_json::Value::String(unit.clone()));
    }
    if let Some(ts) = point.source_ts {
        map.insert(
            "source_ts".to_string(),
            serde_json::Value::String(ts.to_rfc3339()),
        );
    }
    if let Some(ts) = point.server_ts {
        map.insert(
            "server_ts".to_string(),
            serde_json::Value::String(ts.to_rfc3339()),
        );
    }
    serde_json::Value::Object(map)
}

/// One tab-separated COPY row, newline terminated
fn copy_row(point: &DataPoint) -> String {
    let value = point
        .value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "\\N".to_string());
    let value_str = point
        .value_str
        .as_deref()
        .map(copy_escape)
        .unwrap_or_else(|| "\\N".to_string());
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\n",
        point.ts.to_rfc3339(),
        copy_escape(&point.topic),
        value,
        value_str,
        point.quality.code(),
        copy_escape(&metadata_json(point).to_string()),
    )
}

pub struct TsdbWriter {
    pool: PgPool,
    config: TsdbConfig,
}

impl TsdbWriter {
    pub async fn connect(config: TsdbConfig) -> IngestResult<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .idle_timeout(Duration::from_secs(config.max_idle_time_secs))
            .connect(&config.url())
            .await?;
        info!(
            host = %config.host,
            database = %config.database,
            pool_size = config.pool_size,
            "Connected to time-series store"
        );
        Ok(Arc::new(Self { pool, config }))
    }

    /// Liveness probe for the readiness endpoint
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Spawn `writer_count` independent writer tasks sharing the batch
    /// channel
    pub fn spawn_writers(
        self: &Arc<Self>,
        rx: mpsc::Receiver<Batch>,
        writer_count: usize,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..writer_count)
            .map(|id| {
                let writer = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let batch = { rx.lock().await.recv().await };
                        match batch {
                            Some(batch) => writer.write_with_retry(id, batch).await,
                            None => {
                                debug!(writer_id = id, "Batch channel closed, writer exiting");
                                return;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Write a batch, retrying transient failures with exponential backoff.
    /// A batch that exhausts its retries is dropped and logged for forensic
    /// replay; it must not block the writer.
    async fn write_with_retry(&self, writer_id: usize, batch: Batch) {
        let count = batch.points.len();
        let first_ts = batch.points.first().map(|p| p.ts);
        let last_ts = batch.points.last().map(|p| p.ts);

        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result = self.write_batch(&batch).await;
            match result {
                Ok(()) => {
                    let path = if self.config.use_copy_protocol {
                        "copy"
                    } else {
                        "unnest"
                    };
                    DB_WRITE_LATENCY
                        .with_label_values(&[path])
                        .observe(started.elapsed().as_secs_f64());
                    BATCHES_WRITTEN_TOTAL.inc();
                    debug!(
                        writer_id,
                        count,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Batch committed"
                    );
                    return;
                }
                Err(IngestError::Database(e)) if is_transient_db_error(&e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        WRITE_ERRORS_TOTAL.inc();
                        error!(
                            writer_id,
                            count,
                            attempts = attempt,
                            first_ts = ?first_ts,
                            last_ts = ?last_ts,
                            error = %e,
                            "Batch dropped after exhausting retries"
                        );
                        return;
                    }
                    let delay = Duration::from_millis(
                        self.config.retry_delay_ms << (attempt - 1).min(6),
                    )
                    .min(MAX_RETRY_DELAY);
                    warn!(
                        writer_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient write failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // schema or auth problems do not heal with retries
                    WRITE_ERRORS_TOTAL.inc();
                    error!(
                        writer_id,
                        count,
                        first_ts = ?first_ts,
                        last_ts = ?last_ts,
                        error = %e,
                        "Batch dropped on non-transient error"
                    );
                    return;
                }
            }
        }
    }

    async fn write_batch(&self, batch: &Batch) -> IngestResult<()> {
        if batch.points.is_empty() {
            return Ok(());
        }
        if self.config.use_copy_protocol {
            self.copy_batch(batch).await
        } else {
            self.unnest_batch(batch).await
        }
    }

    /// Bulk load through the COPY protocol
    async fn copy_batch(&self, batch: &Batch) -> IngestResult<()> {
        let mut conn = self.pool.acquire().await?;
        let mut sink = conn
            .copy_in_raw(
                "COPY metrics (time, topic, value, value_str, quality, metadata) FROM STDIN",
            )
            .await?;

        let mut buffer = String::with_capacity(batch.points.len() * 128);
        for point in &batch.points {
            buffer.push_str(&copy_row(point));
        }
        if let Err(e) = sink.send(buffer.into_bytes()).await {
            let _ = sink.abort("copy send failed").await;
            return Err(e.into());
        }
        sink.finish().await?;
        Ok(())
    }

    /// Array-based bulk insert for servers where COPY is not wanted
    async fn unnest_batch(&self, batch: &Batch) -> IngestResult<()> {
        let mut times = Vec::with_capacity(batch.points.len());
        let mut topics = Vec::with_capacity(batch.points.len());
        let mut values: Vec<Option<f64>> = Vec::with_capacity(batch.points.len());
        let mut value_strs: Vec<Option<String>> = Vec::with_capacity(batch.points.len());
        let mut qualities: Vec<i16> = Vec::with_capacity(batch.points.len());
        let mut metadata: Vec<serde_json::Value> = Vec::with_capacity(batch.points.len());

        for point in &batch.points {
            times.push(point.ts);
            topics.push(point.topic.clone());
            values.push(point.value);
            value_strs.push(point.value_str.clone());
            qualities.push(point.quality.code());
            metadata.push(metadata_json(point));
        }

        sqlx::query(
            r#"
            INSERT INTO metrics (time, topic, value, value_str, quality, metadata)
            SELECT * FROM UNNEST(
                $1::timestamptz[],
                $2::text[],
                $3::double precision[],
                $4::text[],
                $5::smallint[],
                $6::jsonb[]
            )
            "#,
        )
        .bind(&times[..])
        .bind(&topics[..])
        .bind(&values[..])
        .bind(&value_strs[..])
        .bind(&qualities[..])
        .bind(&metadata[..])
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;
    use chrono::{TimeZone, Utc};

    fn point() -> DataPoint {
        DataPoint {
            device_id: "plc-001".to_string(),
            tag_id: "t1".to_string(),
            topic: "plant1/line2/plc1/Temperature".to_string(),
            value: Some(84.5),
            value_str: None,
            unit: Some("°C".to_string()),
            quality: Quality::Good,
            ts: Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap(),
            source_ts: None,
            server_ts: None,
            raw_value: Some(845.0),
            is_bool: false,
        }
    }

    #[test]
    fn test_copy_escape() {
        assert_eq!(copy_escape("plain"), "plain");
        assert_eq!(copy_escape("a\tb"), "a\\tb");
        assert_eq!(copy_escape("a\nb"), "a\\nb");
        assert_eq!(copy_escape("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_copy_row_layout() {
        let row = copy_row(&point());
        let fields: Vec<&str> = row.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[1], "plant1/line2/plc1/Temperature");
        assert_eq!(fields[2], "84.5");
        assert_eq!(fields[3], "\\N"); // no string value
        assert_eq!(fields[4], "0"); // quality good
        assert!(fields[5].contains("\"device_id\":\"plc-001\""));
        assert!(row.ends_with('\n'));
    }

    #[test]
    fn test_copy_row_string_value() {
        let mut p = point();
        p.value = None;
        p.value_str = Some("RUN\tNING".to_string());
        let row = copy_row(&p);
        let fields: Vec<&str> = row.trim_end().split('\t').collect();
        assert_eq!(fields[2], "\\N");
        assert_eq!(fields[3], "RUN\\tNING");
    }

    #[test]
    fn test_metadata_contents() {
        let mut p = point();
        p.source_ts = Some(p.ts);
        let meta = metadata_json(&p);
        assert_eq!(meta["device_id"], "plc-001");
        assert_eq!(meta["tag_id"], "t1");
        assert_eq!(meta["unit"], "°C");
        assert!(meta["source_ts"].is_string());
        assert!(meta.get("server_ts").is_none());
    }
}
