use super::state::PendingSample;
use super::types::CombinedRecord;
use super::SampleMerger;
use crate::pipeline::{BridgeStats, PipelineHandle};
use crate::telemetry::{parse_reading, ReadingError, SensorKind};
use anyhow::Result;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    /// Topic is not one of the sensor topics.
    Ignored,
    /// Payload failed validation; the slot was left as it was.
    Rejected(ReadingError),
    /// Value stored, still waiting on other kinds.
    Pending { kind: SensorKind, filled: usize },
    /// All kinds present; the slots were cleared and the record handed to the
    /// write queue, which drops it if full.
    Emitted(CombinedRecord),
}

impl SampleMerger {
    pub fn new(
        namespace: impl Into<String>,
        measurement: impl Into<String>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            measurement: measurement.into(),
            pipeline,
            state: Arc::new(Mutex::new(PendingSample::new())),
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.pipeline.stats()
    }

    pub async fn pending(&self) -> PendingSample {
        self.state.lock().await.clone()
    }

    pub async fn reset(&self) {
        self.state.lock().await.reset();
    }

    /// Waits until every record emitted so far has been written or dropped.
    pub async fn flush(&self) -> Result<()> {
        self.pipeline.flush().await
    }

    pub async fn ingest(&self, topic: &str, payload: Bytes) -> Result<IngestOutcome> {
        let Some(reading) = parse_reading(&self.namespace, topic, payload) else {
            tracing::trace!(topic, "ignoring message on unrecognized topic");
            return Ok(IngestOutcome::Ignored);
        };

        let stats = self.stats();
        let value = match reading.value() {
            Ok(value) => value,
            Err(err) => {
                stats.readings_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error=%err, topic, "dropping malformed reading");
                return Ok(IngestOutcome::Rejected(err));
            }
        };
        let stored = {
            let mut state = self.state.lock().await;
            state.set(reading.kind, value).map(|()| {
                let filled = state.filled();
                (state.take_complete(&self.measurement), filled)
            })
        };
        let (record, filled) = match stored {
            Ok(stored) => stored,
            Err(err) => {
                stats.readings_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error=%err, topic, "reading does not fit its slot");
                return Ok(IngestOutcome::Rejected(err));
            }
        };
        stats.readings_accepted.fetch_add(1, Ordering::Relaxed);

        let Some(record) = record else {
            tracing::debug!(kind=%reading.kind, filled, "stored reading");
            return Ok(IngestOutcome::Pending {
                kind: reading.kind,
                filled,
            });
        };

        stats.records_emitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            temperature = record.temperature,
            heater = record.heater,
            light = record.light,
            "combined sample complete"
        );
        self.pipeline.enqueue(record.clone())?;
        Ok(IngestOutcome::Emitted(record))
    }
}
