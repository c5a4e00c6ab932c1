use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RecordId, ResponderId};

/// Which kind of response event produced the first response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Task,
    Message,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Message => "message",
        }
    }
}

/// The reconciled time-to-first-response summary for one business record.
///
/// Invariant: `first_responded_at` only ever moves earlier, and the four
/// response attributes change together or not at all.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirstResponseState {
    pub record_id: RecordId,
    /// When the business record itself was created; the baseline for the
    /// minutes computation.
    pub created_at: DateTime<Utc>,
    pub first_responded_at: Option<DateTime<Utc>>,
    pub responder_id: Option<ResponderId>,
    pub response_source: Option<ResponseSource>,
    pub minutes_to_first_response: Option<i64>,
}

impl FirstResponseState {
    /// State for a record with no response observed yet.
    pub fn unresponded(record_id: RecordId, created_at: DateTime<Utc>) -> Self {
        Self {
            record_id,
            created_at,
            first_responded_at: None,
            responder_id: None,
            response_source: None,
            minutes_to_first_response: None,
        }
    }

    /// Earliest-wins comparison: unset compares as "after everything".
    pub fn would_accept(&self, candidate: DateTime<Utc>) -> bool {
        match self.first_responded_at {
            Some(current) => candidate < current,
            None => true,
        }
    }

    /// Apply an update in place (used by sink implementations after the
    /// precondition has been checked).
    pub fn apply(&mut self, update: &FirstResponseUpdate) {
        self.first_responded_at = Some(update.first_responded_at);
        self.responder_id = Some(update.responder_id.clone());
        self.response_source = Some(update.response_source);
        self.minutes_to_first_response = Some(update.minutes_to_first_response);
    }
}

/// The four-attribute patch submitted as a single conditional write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirstResponseUpdate {
    pub first_responded_at: DateTime<Utc>,
    pub responder_id: ResponderId,
    pub response_source: ResponseSource,
    pub minutes_to_first_response: i64,
}

impl FirstResponseUpdate {
    pub fn for_candidate(
        record_created_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
        responder_id: ResponderId,
        source: ResponseSource,
    ) -> Self {
        let minutes = (occurred_at - record_created_at).num_minutes();
        Self {
            first_responded_at: occurred_at,
            responder_id,
            response_source: source,
            minutes_to_first_response: minutes,
        }
    }
}

/// Result of one reconciliation pass, emitted for metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    DiscardedNotEarlier,
    Failed,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::DiscardedNotEarlier => "discarded_not_earlier",
            Self::Failed => "failed",
        }
    }
}
