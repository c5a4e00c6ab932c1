use async_trait::async_trait;

use crate::errors::PipelineError;
use crate::ids::RecordId;
use crate::state::{FirstResponseState, FirstResponseUpdate};

/// Precondition attached to a state write. The sink, not the caller,
/// evaluates it against the currently stored value, so two racing
/// reconciliations cannot both win.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Apply only if the stored `first_responded_at` is unset or strictly
    /// later than the update's timestamp.
    IfEarlierThanStored,
    /// Apply regardless. Reserved for operator tooling and tests.
    Unconditional,
}

/// Whether a conditional write took effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The precondition failed; the stored state already holds an earlier
    /// or equal response. Not an error.
    Rejected,
}

/// Capability interface over the record store that persists reconciled
/// first-response state. The reconciler is the sole writer; any backing
/// store with per-record conditional-write semantics satisfies this.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn read_state(
        &self,
        record_id: &RecordId,
    ) -> Result<Option<FirstResponseState>, PipelineError>;

    /// Submit the four-attribute update as one atomic write, applied only
    /// if `precondition` still holds at the sink.
    async fn conditional_write(
        &self,
        record_id: &RecordId,
        update: FirstResponseUpdate,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome, PipelineError>;
}
