use async_trait::async_trait;

use crate::errors::PipelineError;
use crate::event::ChangeEvent;

/// A unit of event processing registered with the dispatcher for one or
/// more object types. Handlers must be idempotent: the dispatcher
/// guarantees at-least-once delivery, never exactly-once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Process one event. Retryable errors are retried by the dispatcher's
    /// policy; everything else dead-letters the event.
    async fn handle(&self, event: &ChangeEvent) -> Result<(), PipelineError>;
}
