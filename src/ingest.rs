mod merger;
mod state;
mod types;


use crate::pipeline::PipelineHandle;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use merger::IngestOutcome;
pub use state::PendingSample;
pub use types::CombinedRecord;

/// Accumulates one reading per sensor kind and hands a combined point to the writer
/// once every kind has reported.
#[derive(Clone)]
pub struct SampleMerger {
    namespace: String,
    measurement: String,
    pipeline: PipelineHandle,
    state: Arc<Mutex<PendingSample>>,
}
