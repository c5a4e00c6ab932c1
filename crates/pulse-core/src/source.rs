use async_trait::async_trait;

use crate::errors::PipelineError;
use crate::event::{Channel, ChangeEvent, ReplayPosition};

/// Where a channel's stream currently sits in its connection lifecycle.
/// Exposed for per-channel health reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Disconnected,
    Connecting,
    Streaming,
    ErrorBackoff,
    /// Degraded mode: periodic fetch of all changes since the last known
    /// position instead of a live subscription.
    Polling,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::ErrorBackoff => "error_backoff",
            Self::Polling => "polling",
        }
    }
}

/// An open, positioned sequence of decoded change events for one channel.
///
/// Ordering: events arrive in non-decreasing `replay_position` order, and
/// never at or before the position the stream was opened from.
#[async_trait]
pub trait EventStream: Send {
    /// Suspend until the next event is available. `Err(Decode { .. })`
    /// reports a malformed message the stream has already moved past;
    /// `Err(Cancelled)` means the stream was closed underneath the caller.
    async fn next(&mut self) -> Result<ChangeEvent, PipelineError>;

    /// Release transport resources. Safe to call from any state.
    async fn close(&mut self);

    fn state(&self) -> SourceState;
}

/// Produces replayable event streams, hiding whether the transport is a
/// push subscription or a polling loop.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a stream positioned after `resume_from`, or at "now" on a
    /// first-ever run.
    async fn open(
        &self,
        channel: &Channel,
        resume_from: Option<ReplayPosition>,
    ) -> Result<Box<dyn EventStream>, PipelineError>;
}
