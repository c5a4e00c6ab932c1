use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use pulse_core::errors::PipelineError;
use pulse_core::ids::RecordId;
use pulse_core::sink::{StateSink, WriteOutcome, WritePrecondition};
use pulse_core::state::{FirstResponseState, FirstResponseUpdate};

/// In-process sink with per-record conditional writes. The shard lock held
/// by the entry API makes read-compare-apply atomic per record, which is
/// exactly the guarantee the real record store provides.
#[derive(Default)]
pub struct MemorySink {
    records: DashMap<RecordId, FirstResponseState>,
    fail_next: Mutex<VecDeque<PipelineError>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record in the unresponded state.
    pub fn register_record(&self, record_id: RecordId, created_at: DateTime<Utc>) {
        self.records.insert(
            record_id.clone(),
            FirstResponseState::unresponded(record_id, created_at),
        );
    }

    pub fn get(&self, record_id: &RecordId) -> Option<FirstResponseState> {
        self.records.get(record_id).map(|r| r.clone())
    }

    /// Queue an error for the next sink operation.
    pub fn fail_next(&self, error: PipelineError) {
        self.fail_next.lock().push_back(error);
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn take_failure(&self) -> Option<PipelineError> {
        self.fail_next.lock().pop_front()
    }
}

#[async_trait]
impl StateSink for MemorySink {
    async fn read_state(
        &self,
        record_id: &RecordId,
    ) -> Result<Option<FirstResponseState>, PipelineError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(self.records.get(record_id).map(|r| r.clone()))
    }

    async fn conditional_write(
        &self,
        record_id: &RecordId,
        update: FirstResponseUpdate,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome, PipelineError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        match self.records.get_mut(record_id) {
            Some(mut state) => {
                let accept = match precondition {
                    WritePrecondition::IfEarlierThanStored => {
                        state.would_accept(update.first_responded_at)
                    }
                    WritePrecondition::Unconditional => true,
                };
                if accept {
                    state.apply(&update);
                    Ok(WriteOutcome::Applied)
                } else {
                    Ok(WriteOutcome::Rejected)
                }
            }
            None => Err(PipelineError::Extraction(format!(
                "record {record_id} not present at sink"
            ))),
        }
    }
}
