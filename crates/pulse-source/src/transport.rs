use async_trait::async_trait;

use pulse_core::errors::PipelineError;
use pulse_core::event::{Channel, ReplayPosition};

/// A change notification as it arrives off the wire, before any
/// interpretation. `replay_id` is the provider's position token for the
/// channel; `payload` is the undecoded event body.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub replay_id: i64,
    pub payload: serde_json::Value,
}

/// A live push subscription on one channel.
#[async_trait]
pub trait PushSubscription: Send {
    /// Next raw message, blocking until one arrives or the subscription
    /// breaks. Errors here mean the subscription is dead; the caller
    /// decides whether to resubscribe or degrade.
    async fn recv(&mut self) -> Result<RawMessage, PipelineError>;

    /// Tear down the subscription. Best effort.
    async fn unsubscribe(&mut self);
}

/// Push delivery: subscribe to a channel, optionally resuming after a
/// previously recorded position.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(
        &self,
        channel: &Channel,
        resume_after: Option<ReplayPosition>,
    ) -> Result<Box<dyn PushSubscription>, PipelineError>;
}

/// Pull delivery: query for changes recorded after a position. The
/// degraded path when push is not available.
#[async_trait]
pub trait PollTransport: Send + Sync {
    async fn fetch_since(
        &self,
        channel: &Channel,
        after: Option<ReplayPosition>,
        limit: u32,
    ) -> Result<Vec<RawMessage>, PipelineError>;
}
