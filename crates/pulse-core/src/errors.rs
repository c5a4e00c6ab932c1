use std::time::Duration;

use crate::event::ReplayPosition;

/// Typed error hierarchy for pipeline operations.
/// Classifies errors as retryable (transient transport/persistence
/// trouble), skippable (malformed input that can never be retried
/// correctly), or dead-letter (reconciliation logic failures).
#[derive(Clone, Debug, thiserror::Error)]
pub enum PipelineError {
    // Transport
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("push subscription unavailable: {0}")]
    SubscriptionUnavailable(String),
    #[error("malformed event: {detail}")]
    Decode {
        detail: String,
        /// Position of the malformed message, when the transport exposed
        /// one. The cursor still advances past it.
        position: Option<ReplayPosition>,
    },

    // Persistence
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("state sink unavailable: {0}")]
    SinkUnavailable(String),

    // Reconciliation logic
    #[error("field extraction failed: {0}")]
    Extraction(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Transient failures that the retry/backoff policy should absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Persistence(_)
                | Self::SinkUnavailable(_)
                | Self::Timeout(_)
        )
    }

    /// Malformed input: log, count, advance the cursor, move on.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::SubscriptionUnavailable(_) => "subscription_unavailable",
            Self::Decode { .. } => "decode",
            Self::Persistence(_) => "persistence",
            Self::SinkUnavailable(_) => "sink_unavailable",
            Self::Extraction(_) => "extraction",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}
