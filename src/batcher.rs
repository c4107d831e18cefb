//! Ingestion batcher
//!
//! Accumulates points from the subscriber channel and seals a batch when it
//! reaches `batch_size`, when the oldest point in it is `flush_interval`
//! old, or when shutdown is requested. Sealed batches go to the writer
//! channel (capacity `writer_count * 2` to decouple accumulation from write
//! latency). Arrival order is preserved within a batch.

use crate::config::IngestionConfig;
use crate::metrics::BATCH_SIZE;
use crate::model::DataPoint;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Ordered points bound for one bulk write
#[derive(Debug)]
pub struct Batch {
    pub points: Vec<DataPoint>,
    pub opened_at: Instant,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            opened_at: Instant::now(),
        }
    }
}

pub struct Batcher {
    config: IngestionConfig,
}

impl Batcher {
    pub fn new(config: IngestionConfig) -> Self {
        Self { config }
    }

    /// Channel capacity for sealed batches
    pub fn writer_channel_capacity(&self) -> usize {
        self.config.writer_count * 2
    }

    /// Accumulate until the input channel closes or shutdown fires. On
    /// shutdown the input channel is drained and the in-flight batch is
    /// flushed before the writer channel closes (dropping the sender).
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<DataPoint>,
        batch_tx: mpsc::Sender<Batch>,
        shutdown: CancellationToken,
    ) {
        let batch_size = self.config.batch_size;
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms);
        let mut batch = Batch::new(batch_size);

        loop {
            let deadline = batch.opened_at + flush_interval;
            tokio::select! {
                point = rx.recv() => match point {
                    Some(point) => {
                        if batch.points.is_empty() {
                            batch.opened_at = Instant::now();
                        }
                        batch.points.push(point);
                        if batch.points.len() >= batch_size {
                            batch = Self::seal(batch, batch_size, &batch_tx, "size").await;
                        }
                    }
                    None => {
                        if !batch.points.is_empty() {
                            let _ = Self::seal(batch, batch_size, &batch_tx, "close").await;
                        }
                        info!("Batcher input closed");
                        return;
                    }
                },
                _ = sleep_until(deadline), if !batch.points.is_empty() => {
                    batch = Self::seal(batch, batch_size, &batch_tx, "time").await;
                }
                _ = shutdown.cancelled() => {
                    // drain whatever already made it into the channel
                    while let Ok(point) = rx.try_recv() {
                        batch.points.push(point);
                        if batch.points.len() >= batch_size {
                            batch = Self::seal(batch, batch_size, &batch_tx, "shutdown").await;
                        }
                    }
                    if !batch.points.is_empty() {
                        let _ = Self::seal(batch, batch_size, &batch_tx, "shutdown").await;
                    }
                    info!("Batcher flushed and stopped");
                    return;
                }
            }
        }
    }

    async fn seal(
        batch: Batch,
        batch_size: usize,
        batch_tx: &mpsc::Sender<Batch>,
        trigger: &'static str,
    ) -> Batch {
        debug_assert!(!batch.points.is_empty() && batch.points.len() <= batch_size);
        let count = batch.points.len();
        BATCH_SIZE.with_label_values(&[trigger]).observe(count as f64);
        debug!(count, trigger, "Sealing batch");
        if batch_tx.send(batch).await.is_err() {
            debug!("Writer channel closed, batch discarded");
        }
        Batch::new(batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;
    use chrono::Utc;

    fn point(n: usize) -> DataPoint {
        DataPoint {
            device_id: "plc-001".to_string(),
            tag_id: format!("t{n}"),
            topic: format!("plant/line/dev/t{n}"),
            value: Some(n as f64),
            quality: Quality::Good,
            ts: Utc::now(),
            ..Default::default()
        }
    }

    fn batcher(batch_size: usize, flush_interval_ms: u64) -> Batcher {
        Batcher::new(IngestionConfig {
            batch_size,
            flush_interval_ms,
            writer_count: 2,
            ..IngestionConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_size() {
        let (tx, rx) = mpsc::channel(64);
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(batcher(3, 10_000).run(rx, batch_tx, shutdown.clone()));

        for n in 0..7 {
            tx.send(point(n)).await.unwrap();
        }
        let first = batch_rx.recv().await.unwrap();
        let second = batch_rx.recv().await.unwrap();
        assert_eq!(first.points.len(), 3);
        assert_eq!(second.points.len(), 3);
        // order preserved within batches
        assert_eq!(first.points[0].tag_id, "t0");
        assert_eq!(second.points[0].tag_id, "t3");

        shutdown.cancel();
        let third = batch_rx.recv().await.unwrap();
        assert_eq!(third.points.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_time() {
        let (tx, rx) = mpsc::channel(64);
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(batcher(5000, 100).run(rx, batch_tx, shutdown.clone()));

        tx.send(point(0)).await.unwrap();
        tx.send(point(1)).await.unwrap();

        // well under batch_size, so only the timer can seal it
        let batch = tokio::time::timeout(Duration::from_secs(1), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.points.len(), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending() {
        let (tx, rx) = mpsc::channel(64);
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(batcher(5000, 60_000).run(rx, batch_tx, shutdown.clone()));

        tx.send(point(0)).await.unwrap();
        tx.send(point(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        shutdown.cancel();
        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.points.len(), 2);
        handle.await.unwrap();

        // writer channel closes once the batcher returns
        assert!(batch_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_never_exceed_batch_size() {
        let (tx, rx) = mpsc::channel(256);
        let (batch_tx, mut batch_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(batcher(4, 50).run(rx, batch_tx, shutdown.clone()));

        for n in 0..21 {
            tx.send(point(n)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let mut total = 0;
        while let Some(batch) = batch_rx.recv().await {
            assert!(!batch.points.is_empty());
            assert!(batch.points.len() <= 4);
            total += batch.points.len();
        }
        assert_eq!(total, 21);
    }
}
