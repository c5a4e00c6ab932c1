//! Scripted transports for exercising the stream state machine without a
//! network. Each subscribe attempt consumes one scripted outcome; each
//! `recv` consumes one scripted step. An exhausted session goes quiet
//! rather than erroring, which models an idle subscription.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use pulse_core::errors::PipelineError;
use pulse_core::event::{Channel, ReplayPosition};

use crate::transport::{PollTransport, PushSubscription, PushTransport, RawMessage};

/// What one subscribe attempt does.
pub enum SubscribeOutcome {
    /// Subscription established; `recv` walks these steps.
    Accept(Vec<RecvStep>),
    /// Transient connect failure.
    Fail(String),
    /// Push delivery not offered for this channel.
    Unavailable(String),
}

/// What one `recv` call does.
pub enum RecvStep {
    Deliver(RawMessage),
    /// Subscription breaks with a transient error.
    Error(String),
    /// Subscription breaks because push became unavailable.
    Unavailable(String),
}

pub struct ScriptedPush {
    outcomes: Mutex<VecDeque<SubscribeOutcome>>,
    subscribe_calls: AtomicU32,
    unsubscribe_calls: Arc<AtomicU32>,
}

impl ScriptedPush {
    pub fn new(outcomes: Vec<SubscribeOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            subscribe_calls: AtomicU32::new(0),
            unsubscribe_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::Relaxed)
    }

    pub fn unsubscribe_calls(&self) -> u32 {
        self.unsubscribe_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PushTransport for ScriptedPush {
    async fn subscribe(
        &self,
        _channel: &Channel,
        _resume_after: Option<ReplayPosition>,
    ) -> Result<Box<dyn PushSubscription>, PipelineError> {
        self.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        let outcome = self.outcomes.lock().pop_front();
        match outcome {
            Some(SubscribeOutcome::Accept(steps)) => Ok(Box::new(ScriptedSubscription {
                steps: steps.into(),
                unsubscribe_calls: Arc::clone(&self.unsubscribe_calls),
            })),
            Some(SubscribeOutcome::Fail(msg)) => Err(PipelineError::Connect(msg)),
            Some(SubscribeOutcome::Unavailable(msg)) => {
                Err(PipelineError::SubscriptionUnavailable(msg))
            }
            None => Err(PipelineError::Connect("subscribe script exhausted".into())),
        }
    }
}

pub struct ScriptedSubscription {
    steps: VecDeque<RecvStep>,
    unsubscribe_calls: Arc<AtomicU32>,
}

#[async_trait]
impl PushSubscription for ScriptedSubscription {
    async fn recv(&mut self) -> Result<RawMessage, PipelineError> {
        match self.steps.pop_front() {
            Some(RecvStep::Deliver(raw)) => Ok(raw),
            Some(RecvStep::Error(msg)) => Err(PipelineError::Connect(msg)),
            Some(RecvStep::Unavailable(msg)) => {
                Err(PipelineError::SubscriptionUnavailable(msg))
            }
            // Quiet subscription: nothing more to say, ever
            None => futures::future::pending().await,
        }
    }

    async fn unsubscribe(&mut self) {
        self.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
    }
}

/// Queryable change log: `fetch_since` returns everything recorded after
/// the given position, up to the limit. Messages may be appended while a
/// stream is live.
pub struct ScriptedPoll {
    messages: Mutex<Vec<RawMessage>>,
    failures: Mutex<VecDeque<String>>,
    fetch_calls: AtomicU32,
}

impl ScriptedPoll {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages: Mutex::new(messages),
            failures: Mutex::new(VecDeque::new()),
            fetch_calls: AtomicU32::new(0),
        }
    }

    pub fn push_message(&self, raw: RawMessage) {
        self.messages.lock().push(raw);
    }

    /// Queue a failure for the next fetch attempt.
    pub fn fail_next(&self, msg: impl Into<String>) {
        self.failures.lock().push_back(msg.into());
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PollTransport for ScriptedPoll {
    async fn fetch_since(
        &self,
        _channel: &Channel,
        after: Option<ReplayPosition>,
        limit: u32,
    ) -> Result<Vec<RawMessage>, PipelineError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(msg) = self.failures.lock().pop_front() {
            return Err(PipelineError::Connect(msg));
        }
        let floor = after.map(|p| p.as_i64()).unwrap_or(i64::MIN);
        let mut out: Vec<RawMessage> = self
            .messages
            .lock()
            .iter()
            .filter(|m| m.replay_id > floor)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.replay_id);
        out.truncate(limit as usize);
        Ok(out)
    }
}

/// A well-formed raw message for the given entity, usable in tests across
/// the workspace.
pub fn raw_event(replay_id: i64, entity: &str, record_id: &str) -> RawMessage {
    RawMessage {
        replay_id,
        payload: json!({
            "ChangeEventHeader": {
                "entityName": entity,
                "changeType": "CREATE",
                "recordIds": [record_id],
                "commitTimestamp": 1_767_225_600_000_i64 + replay_id * 1000
            }
        }),
    }
}

/// A raw message whose payload cannot be decoded.
pub fn raw_garbage(replay_id: i64) -> RawMessage {
    RawMessage {
        replay_id,
        payload: json!({"not_a_header": true}),
    }
}
