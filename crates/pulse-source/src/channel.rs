use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use pulse_core::errors::PipelineError;
use pulse_core::event::{Channel, ChangeEvent, ReplayPosition};
use pulse_core::source::{EventSource, EventStream, SourceState};

use crate::backoff::Backoff;
use crate::config::SourceConfig;
use crate::decode::decode;
use crate::transport::{PollTransport, PushSubscription, PushTransport, RawMessage};

/// Opens positioned event streams over a push transport, degrading to a
/// polling transport when push cannot be established or keeps breaking.
pub struct ChannelSource {
    push: Arc<dyn PushTransport>,
    poll: Arc<dyn PollTransport>,
    config: SourceConfig,
}

impl ChannelSource {
    pub fn new(
        push: Arc<dyn PushTransport>,
        poll: Arc<dyn PollTransport>,
        config: SourceConfig,
    ) -> Self {
        Self { push, poll, config }
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn open(
        &self,
        channel: &Channel,
        resume_from: Option<ReplayPosition>,
    ) -> Result<Box<dyn EventStream>, PipelineError> {
        let backoff = Backoff::from_config(&self.config);
        let mut stream = ChannelStream {
            channel: channel.clone(),
            push: Arc::clone(&self.push),
            poll: Arc::clone(&self.poll),
            config: self.config.clone(),
            backoff,
            state: SourceState::Disconnected,
            subscription: None,
            last_position: resume_from,
            baselined: resume_from.is_some(),
            consecutive_failures: 0,
            buffer: VecDeque::new(),
            next_poll_at: None,
            last_probe_at: None,
        };

        if !self.config.poll_only {
            for attempt in 0..self.config.fallback_threshold {
                match timeout(
                    self.config.connect_timeout,
                    self.push.subscribe(channel, resume_from),
                )
                .await
                {
                    Ok(Ok(sub)) => {
                        info!(channel = %channel, resume_from = ?resume_from, "subscribed");
                        stream.subscription = Some(sub);
                        stream.state = SourceState::Streaming;
                        return Ok(Box::new(stream));
                    }
                    Ok(Err(PipelineError::SubscriptionUnavailable(msg))) => {
                        warn!(channel = %channel, %msg, "push unavailable, degrading to polling");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(channel = %channel, attempt, error = %e, "subscribe failed");
                    }
                    Err(_) => {
                        warn!(channel = %channel, attempt, "subscribe timed out");
                    }
                }
                if attempt + 1 < self.config.fallback_threshold {
                    sleep(stream.backoff.delay_for(attempt)).await;
                }
            }
        }

        // Polling fallback. Validate the pull path before handing the
        // stream out; a channel we can neither push- nor pull-read from
        // is a connect failure, not a silently idle stream.
        self.poll
            .fetch_since(channel, resume_from, 1)
            .await
            .map_err(|e| PipelineError::Connect(format!("polling probe failed: {e}")))?;

        stream.enter_polling();
        Ok(Box::new(stream))
    }
}

/// One channel's live stream.
///
/// Lifecycle: Streaming until the subscription breaks, then ErrorBackoff
/// and Connecting to resubscribe. After `fallback_threshold` consecutive
/// failures, or whenever the transport reports push unavailable, the
/// stream degrades to Polling. Polling re-probes push every
/// `reprobe_interval` and promotes itself back to Streaming on success.
/// `last_position` gates delivery in every mode, so a resubscribe or a
/// poll fetch can never re-deliver an event already handed out.
///
/// A first-ever run has no resume position. In polling mode the stream
/// records the newest pre-existing position before delivering anything,
/// so the backlog that predates the consumer is never replayed.
struct ChannelStream {
    channel: Channel,
    push: Arc<dyn PushTransport>,
    poll: Arc<dyn PollTransport>,
    config: SourceConfig,
    backoff: Backoff,
    state: SourceState,
    subscription: Option<Box<dyn PushSubscription>>,
    last_position: Option<ReplayPosition>,
    baselined: bool,
    consecutive_failures: u32,
    buffer: VecDeque<RawMessage>,
    next_poll_at: Option<Instant>,
    last_probe_at: Option<Instant>,
}

impl ChannelStream {
    fn enter_polling(&mut self) {
        self.state = SourceState::Polling;
        self.next_poll_at = None;
        self.last_probe_at = Some(Instant::now());
    }

    /// Position-gate and decode one raw message. None means the message
    /// was at or before the last delivered position and is dropped.
    fn accept(&mut self, raw: RawMessage) -> Option<Result<ChangeEvent, PipelineError>> {
        let position = ReplayPosition::new(raw.replay_id);
        if let Some(last) = self.last_position {
            if position <= last {
                debug!(channel = %self.channel, %position, "dropping replayed message");
                return None;
            }
        }
        // Advance even when decoding fails: a malformed message must not
        // wedge the channel.
        self.last_position = Some(position);
        Some(decode(&self.channel, &raw))
    }

    async fn drop_subscription(&mut self) {
        if let Some(mut sub) = self.subscription.take() {
            sub.unsubscribe().await;
        }
    }

    async fn next_streaming(&mut self) -> Option<Result<ChangeEvent, PipelineError>> {
        let sub = match self.subscription.as_mut() {
            Some(sub) => sub,
            None => {
                self.state = SourceState::Connecting;
                return None;
            }
        };
        match sub.recv().await {
            Ok(raw) => self.accept(raw),
            Err(PipelineError::SubscriptionUnavailable(msg)) => {
                warn!(channel = %self.channel, %msg, "push revoked, degrading to polling");
                self.drop_subscription().await;
                self.enter_polling();
                None
            }
            Err(e) => {
                self.drop_subscription().await;
                self.consecutive_failures += 1;
                warn!(
                    channel = %self.channel,
                    failures = self.consecutive_failures,
                    error = %e,
                    "subscription broke"
                );
                if self.consecutive_failures >= self.config.fallback_threshold {
                    self.enter_polling();
                } else {
                    self.state = SourceState::ErrorBackoff;
                }
                None
            }
        }
    }

    async fn next_connecting(&mut self) {
        match timeout(
            self.config.connect_timeout,
            self.push.subscribe(&self.channel, self.last_position),
        )
        .await
        {
            Ok(Ok(sub)) => {
                info!(channel = %self.channel, resume_from = ?self.last_position, "resubscribed");
                self.subscription = Some(sub);
                self.consecutive_failures = 0;
                self.state = SourceState::Streaming;
            }
            Ok(Err(PipelineError::SubscriptionUnavailable(msg))) => {
                warn!(channel = %self.channel, %msg, "push unavailable, degrading to polling");
                self.enter_polling();
            }
            result => {
                self.consecutive_failures += 1;
                match result {
                    Err(_) => warn!(
                        channel = %self.channel,
                        failures = self.consecutive_failures,
                        "resubscribe timed out"
                    ),
                    Ok(Err(e)) => warn!(
                        channel = %self.channel,
                        failures = self.consecutive_failures,
                        error = %e,
                        "resubscribe failed"
                    ),
                    Ok(Ok(_)) => unreachable!(),
                }
                if self.consecutive_failures >= self.config.fallback_threshold {
                    self.enter_polling();
                } else {
                    self.state = SourceState::ErrorBackoff;
                }
            }
        }
    }

    /// Walk the pre-existing backlog without delivering it, leaving
    /// `last_position` at the newest position found. Returns false when
    /// the backlog could not be read; the caller retries on the normal
    /// poll cadence.
    async fn skip_backlog(&mut self) -> bool {
        loop {
            match self
                .poll
                .fetch_since(&self.channel, self.last_position, self.config.poll_batch_limit)
                .await
            {
                Ok(batch) => {
                    let drained = (batch.len() as u32) < self.config.poll_batch_limit;
                    if let Some(newest) = batch.iter().map(|m| m.replay_id).max() {
                        self.last_position = Some(ReplayPosition::new(newest));
                    }
                    if drained {
                        return true;
                    }
                }
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "backlog fetch failed");
                    return false;
                }
            }
        }
    }

    async fn next_polling(&mut self) -> Option<Result<ChangeEvent, PipelineError>> {
        while let Some(raw) = self.buffer.pop_front() {
            if let Some(result) = self.accept(raw) {
                return Some(result);
            }
        }

        // Periodically see whether push has come back.
        if !self.config.poll_only {
            let probe_due = self
                .last_probe_at
                .map(|at| at.elapsed() >= self.config.reprobe_interval)
                .unwrap_or(true);
            if probe_due {
                self.last_probe_at = Some(Instant::now());
                if let Ok(Ok(sub)) = timeout(
                    self.config.connect_timeout,
                    self.push.subscribe(&self.channel, self.last_position),
                )
                .await
                {
                    info!(channel = %self.channel, "push restored, leaving polling mode");
                    self.subscription = Some(sub);
                    self.consecutive_failures = 0;
                    self.buffer.clear();
                    self.state = SourceState::Streaming;
                    return None;
                }
            }
        }

        if let Some(at) = self.next_poll_at {
            sleep_until(at).await;
        }
        self.next_poll_at = Some(Instant::now() + self.config.poll_interval);

        if !self.baselined {
            if self.last_position.is_none() && !self.skip_backlog().await {
                return None;
            }
            self.baselined = true;
            info!(
                channel = %self.channel,
                start_after = ?self.last_position,
                "first run, delivering changes from now"
            );
            return None;
        }

        match self
            .poll
            .fetch_since(&self.channel, self.last_position, self.config.poll_batch_limit)
            .await
        {
            Ok(batch) => {
                if !batch.is_empty() {
                    debug!(channel = %self.channel, count = batch.len(), "poll fetched changes");
                }
                self.buffer.extend(batch);
            }
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "poll fetch failed");
            }
        }
        None
    }
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next(&mut self) -> Result<ChangeEvent, PipelineError> {
        loop {
            match self.state {
                SourceState::Disconnected => return Err(PipelineError::Cancelled),
                SourceState::Streaming => {
                    if let Some(result) = self.next_streaming().await {
                        return result;
                    }
                }
                SourceState::ErrorBackoff => {
                    let attempt = self.consecutive_failures.saturating_sub(1);
                    sleep(self.backoff.delay_for(attempt)).await;
                    self.state = SourceState::Connecting;
                }
                SourceState::Connecting => self.next_connecting().await,
                SourceState::Polling => {
                    if let Some(result) = self.next_polling().await {
                        return result;
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.drop_subscription().await;
        self.state = SourceState::Disconnected;
    }

    fn state(&self) -> SourceState {
        self.state
    }
}
