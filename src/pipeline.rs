use crate::influx::InfluxWriter;
use crate::ingest::CombinedRecord;
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum WriteCommand {
    Record(CombinedRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<WriteCommand>,
    stats: Arc<BridgeStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<WriteCommand>, stats: Arc<BridgeStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    /// Hands a record to the writer without waiting. A full queue drops the record
    /// and returns `Ok(false)`; only a closed queue is an error.
    pub fn enqueue(&self, record: CombinedRecord) -> Result<bool> {
        let (temperature, heater, light) = (record.temperature, record.heater, record.light);
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.try_send(WriteCommand::Record(record)) {
            Ok(()) => {
                tracing::trace!(queue_depth, "queued record");
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                self.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    capacity = self.tx.max_capacity(),
                    temperature,
                    heater,
                    light,
                    "write queue full; dropping combined record"
                );
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                Err(anyhow!("write queue closed"))
            }
        }
    }

    /// Resolves once every record queued before this call has been written or dropped.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Flush(tx))
            .await
            .map_err(|_| anyhow!("write queue closed"))?;
        rx.await.map_err(|_| anyhow!("write worker stopped before flushing"))
    }
}

#[derive(Debug)]
pub struct BridgeStats {
    pub queue_depth: AtomicU64,
    pub readings_accepted: AtomicU64,
    pub readings_rejected: AtomicU64,
    pub records_emitted: AtomicU64,
    pub records_written: AtomicU64,
    pub records_dropped: AtomicU64,
    pub write_retries: AtomicU64,
    pub last_write_unix_ms: AtomicU64,
    pub average_write_micros: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            readings_accepted: AtomicU64::new(0),
            readings_rejected: AtomicU64::new(0),
            records_emitted: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            last_write_unix_ms: AtomicU64::new(0),
            average_write_micros: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn log_summary(&self) {
        tracing::info!(
            mqtt_connected = self.mqtt_connected.load(Ordering::Relaxed),
            readings_accepted = self.readings_accepted.load(Ordering::Relaxed),
            readings_rejected = self.readings_rejected.load(Ordering::Relaxed),
            records_emitted = self.records_emitted.load(Ordering::Relaxed),
            records_written = self.records_written.load(Ordering::Relaxed),
            records_dropped = self.records_dropped.load(Ordering::Relaxed),
            write_retries = self.write_retries.load(Ordering::Relaxed),
            queue_depth = self.queue_depth.load(Ordering::Relaxed),
            average_write_micros = self.average_write_micros.load(Ordering::Relaxed),
            last_error = self.last_error().as_deref().unwrap_or(""),
            "bridge status"
        );
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling up to `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        doubling_backoff(self.initial_backoff, self.max_backoff, retry)
    }
}

/// `initial * 2^(n-1)`, capped at `max`. `n` is 1-based.
pub fn doubling_backoff(initial: Duration, max: Duration, n: u32) -> Duration {
    let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
    initial.checked_mul(factor).unwrap_or(max).min(max)
}

pub fn spawn_worker(
    writer: InfluxWriter,
    mut rx: mpsc::Receiver<WriteCommand>,
    stats: Arc<BridgeStats>,
    retry: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriteCommand::Record(record) => {
                    stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    write_with_retry(&writer, &record, &stats, retry).await;
                }
                WriteCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("write queue closed; worker exiting");
    })
}

async fn write_with_retry(
    writer: &InfluxWriter,
    record: &CombinedRecord,
    stats: &BridgeStats,
    retry: RetryPolicy,
) -> bool {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let started = Instant::now();
        match writer.write_record(record).await {
            Ok(()) => {
                stats.records_written.fetch_add(1, Ordering::Relaxed);
                let now = Utc::now().timestamp_millis() as u64;
                stats.last_write_unix_ms.store(now, Ordering::Relaxed);
                let micros = started.elapsed().as_micros() as u64;
                let prev = stats.average_write_micros.load(Ordering::Relaxed);
                let avg = if prev == 0 {
                    micros
                } else {
                    (prev + micros) / 2
                };
                stats.average_write_micros.store(avg, Ordering::Relaxed);
                stats.clear_error();
                tracing::debug!(attempt, micros, "wrote combined record");
                return true;
            }
            Err(err) => {
                stats.record_error(err.to_string());
                if attempt >= max_attempts {
                    stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        error=%err,
                        attempts = attempt,
                        temperature = record.temperature,
                        heater = record.heater,
                        light = record.light,
                        "failed to write combined record; dropping"
                    );
                    return false;
                }
                let delay = retry.backoff(attempt);
                stats.write_retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error=%err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "write failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influx::InfluxSettings;
    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct FlakyStore {
        hits: Arc<AtomicUsize>,
        fail_first: usize,
    }

    async fn flaky_write(State(store): State<FlakyStore>) -> StatusCode {
        let hit = store.hits.fetch_add(1, Ordering::SeqCst);
        if hit < store.fail_first {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::NO_CONTENT
        }
    }

    async fn spawn_store(fail_first: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/write", post(flaky_write))
            .with_state(FlakyStore {
                hits: hits.clone(),
                fail_first,
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), hits)
    }

    fn writer_for(url: &str) -> InfluxWriter {
        InfluxWriter::new(InfluxSettings {
            url: url.to_string(),
            database: "HomeStats".to_string(),
            retention_policy: None,
            username: None,
            password: None,
            timeout: Duration::from_secs(2),
        })
        .expect("writer")
    }

    fn record() -> CombinedRecord {
        CombinedRecord {
            measurement: "Aquarispark".to_string(),
            temperature: 25.3,
            heater: 1,
            light: 0,
        }
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    fn pipeline(writer: InfluxWriter, retry: RetryPolicy) -> (PipelineHandle, Arc<BridgeStats>) {
        let stats = Arc::new(BridgeStats::new());
        let (tx, rx) = mpsc::channel(8);
        spawn_worker(writer, rx, stats.clone(), retry);
        (PipelineHandle::new(tx, stats.clone()), stats)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn retries_until_store_accepts() {
        let (url, hits) = spawn_store(2).await;
        let (handle, stats) = pipeline(writer_for(&url), quick_retry(3));

        assert!(handle.enqueue(record()).expect("enqueue"));
        handle.flush().await.expect("flush");

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(stats.records_written.load(Ordering::Relaxed), 1);
        assert_eq!(stats.write_retries.load(Ordering::Relaxed), 2);
        assert_eq!(stats.records_dropped.load(Ordering::Relaxed), 0);
        assert_eq!(stats.last_error(), None);
    }

    #[tokio::test]
    async fn drops_record_after_last_attempt() {
        let (url, hits) = spawn_store(usize::MAX).await;
        let (handle, stats) = pipeline(writer_for(&url), quick_retry(2));

        assert!(handle.enqueue(record()).expect("enqueue"));
        handle.flush().await.expect("flush");

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(stats.records_written.load(Ordering::Relaxed), 0);
        assert_eq!(stats.records_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.queue_depth.load(Ordering::Relaxed), 0);
        assert!(stats.last_error().is_some());
    }

    #[tokio::test]
    async fn full_queue_drops_record_without_waiting() {
        let stats = Arc::new(BridgeStats::new());
        let (tx, _rx) = mpsc::channel(1);
        let handle = PipelineHandle::new(tx, stats.clone());

        assert!(handle.enqueue(record()).expect("first enqueue"));
        assert!(!handle.enqueue(record()).expect("second enqueue"));

        assert_eq!(stats.records_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.queue_depth.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn flush_fails_once_worker_is_gone() {
        let stats = Arc::new(BridgeStats::new());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = PipelineHandle::new(tx, stats.clone());

        assert!(handle.flush().await.is_err());
        assert!(handle.enqueue(record()).is_err());
        assert_eq!(stats.queue_depth.load(Ordering::Relaxed), 0);
    }
}
