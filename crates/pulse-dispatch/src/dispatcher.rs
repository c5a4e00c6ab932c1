use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pulse_core::errors::PipelineError;
use pulse_core::event::{Channel, ChangeEvent, ReplayPosition};
use pulse_core::source::EventSource;
use pulse_source::backoff::Backoff;
use pulse_store::cursors::CursorRepo;
use pulse_store::dead_letters::DeadLetterRepo;
use pulse_telemetry::{HealthRegistry, MetricsRecorder};

use crate::config::DispatchConfig;
use crate::registry::HandlerRegistry;

/// Runs one consumer task per channel: pull an event, run its handlers,
/// durably advance the cursor, repeat.
///
/// Delivery contract is at-least-once. The cursor only advances after an
/// event's handlers finished or the event was parked in the dead-letter
/// store, so a crash between handler and cursor write re-delivers the
/// event on restart. Handlers are required to tolerate that.
pub struct Dispatcher {
    source: Arc<dyn EventSource>,
    registry: Arc<HandlerRegistry>,
    cursors: Arc<CursorRepo>,
    dead_letters: Arc<DeadLetterRepo>,
    metrics: Arc<MetricsRecorder>,
    health: Arc<HealthRegistry>,
    config: DispatchConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn EventSource>,
        registry: Arc<HandlerRegistry>,
        cursors: Arc<CursorRepo>,
        dead_letters: Arc<DeadLetterRepo>,
        metrics: Arc<MetricsRecorder>,
        health: Arc<HealthRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            source,
            registry,
            cursors,
            dead_letters,
            metrics,
            health,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a consumer task for each channel. Returns immediately; the
    /// consumers run until `shutdown`.
    pub fn start(&self, channels: Vec<Channel>) {
        let mut tasks = self.tasks.lock();
        for channel in channels {
            let worker = ChannelWorker {
                source: Arc::clone(&self.source),
                registry: Arc::clone(&self.registry),
                cursors: Arc::clone(&self.cursors),
                dead_letters: Arc::clone(&self.dead_letters),
                metrics: Arc::clone(&self.metrics),
                health: Arc::clone(&self.health),
                backoff: Backoff::new(
                    self.config.base_delay,
                    self.config.max_delay,
                    self.config.jitter_factor,
                ),
                config: self.config.clone(),
                cancel: self.cancel.clone(),
            };
            tasks.push(tokio::spawn(worker.run(channel)));
        }
    }

    /// Cooperative shutdown: signal every consumer, then wait for them to
    /// close their streams and exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "consumer task join failed");
            }
        }
        info!("dispatcher stopped");
    }
}

struct ChannelWorker {
    source: Arc<dyn EventSource>,
    registry: Arc<HandlerRegistry>,
    cursors: Arc<CursorRepo>,
    dead_letters: Arc<DeadLetterRepo>,
    metrics: Arc<MetricsRecorder>,
    health: Arc<HealthRegistry>,
    backoff: Backoff,
    config: DispatchConfig,
    cancel: CancellationToken,
}

impl ChannelWorker {
    async fn run(self, channel: Channel) {
        let resume_from = match self.cursors.load(&channel) {
            Ok(cursor) => cursor.map(|c| c.last_position),
            Err(e) => {
                error!(channel = %channel, error = %e, "cursor load failed, consumer not started");
                self.health.record_error(&channel, &e.to_string());
                return;
            }
        };

        let mut stream = match self.source.open(&channel, resume_from).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(channel = %channel, error = %e, "stream open failed, consumer not started");
                self.health.record_error(&channel, &e.to_string());
                return;
            }
        };
        info!(channel = %channel, resume_from = ?resume_from, "consumer started");
        self.health.set_state(&channel, stream.state());

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            self.health.set_state(&channel, stream.state());

            match next {
                Ok(event) => {
                    self.health.record_event(&channel, event.occurred_at);
                    if !self.process_event(&channel, &event).await {
                        break;
                    }
                    if !self.advance_cursor(&channel, event.replay_position).await {
                        break;
                    }
                }
                Err(PipelineError::Decode { detail, position }) => {
                    warn!(channel = %channel, %detail, position = ?position, "skipping malformed event");
                    self.metrics
                        .counter_inc("events_skipped_total", &[("channel", channel.as_str())], 1);
                    // A malformed event still consumes its position;
                    // otherwise restart would replay it forever.
                    if let Some(position) = position {
                        if !self.advance_cursor(&channel, position).await {
                            break;
                        }
                    }
                }
                Err(PipelineError::Cancelled) => break,
                Err(e) => {
                    error!(channel = %channel, error = %e, kind = e.error_kind(), "stream failed");
                    self.health.record_error(&channel, &e.to_string());
                    self.metrics.counter_inc(
                        "source_errors_total",
                        &[("channel", channel.as_str()), ("kind", e.error_kind())],
                        1,
                    );
                    break;
                }
            }
        }

        stream.close().await;
        self.health.set_state(&channel, stream.state());
        info!(channel = %channel, "consumer stopped");
    }

    /// Run every registered handler for the event. Returns false only when
    /// the dead-letter store itself is broken, which makes further progress
    /// on this channel unsafe.
    async fn process_event(&self, channel: &Channel, event: &ChangeEvent) -> bool {
        let handlers = self.registry.handlers_for(event.object_type);
        if handlers.is_empty() {
            debug!(channel = %channel, object_type = %event.object_type, "no handlers registered");
        }

        for handler in handlers {
            if !self.run_handler(channel, event, handler.as_ref()).await {
                return false;
            }
        }

        self.metrics
            .counter_inc("events_processed_total", &[("channel", channel.as_str())], 1);
        true
    }

    async fn run_handler(
        &self,
        channel: &Channel,
        event: &ChangeEvent,
        handler: &dyn pulse_core::handler::EventHandler,
    ) -> bool {
        let mut attempt: u32 = 0;
        loop {
            let outcome = std::panic::AssertUnwindSafe(handler.handle(event))
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => e,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "opaque panic".to_string());
                    error!(
                        channel = %channel,
                        handler = handler.name(),
                        record_id = %event.record_id,
                        %detail,
                        "handler panicked"
                    );
                    return self
                        .park_event(channel, event, &format!("panic: {detail}"), attempt + 1)
                        .await;
                }
            };

            if error.is_retryable() && attempt < self.config.max_retries {
                let delay = self.backoff.delay_for(attempt);
                attempt += 1;
                warn!(
                    channel = %channel,
                    handler = handler.name(),
                    record_id = %event.record_id,
                    attempt,
                    max_retries = self.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "handler failed, retrying"
                );
                self.metrics.counter_inc(
                    "handler_retries_total",
                    &[("channel", channel.as_str()), ("handler", handler.name())],
                    1,
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(
                channel = %channel,
                handler = handler.name(),
                record_id = %event.record_id,
                attempts = attempt + 1,
                error = %error,
                kind = error.error_kind(),
                "handler failed permanently, parking event"
            );
            return self
                .park_event(channel, event, &error.to_string(), attempt + 1)
                .await;
        }
    }

    /// Record the event in the dead-letter store so the cursor may move
    /// past it. Retried like any persistence write; if the store stays
    /// broken the channel must stop, because advancing without a record
    /// would silently drop the event.
    async fn park_event(
        &self,
        channel: &Channel,
        event: &ChangeEvent,
        error: &str,
        attempts: u32,
    ) -> bool {
        for write_attempt in 0..=self.config.max_retries {
            match self.dead_letters.insert(event, error, attempts) {
                Ok(_) => {
                    self.metrics.counter_inc(
                        "events_dead_lettered_total",
                        &[("channel", channel.as_str())],
                        1,
                    );
                    return true;
                }
                Err(e) if write_attempt < self.config.max_retries => {
                    warn!(channel = %channel, error = %e, "dead-letter write failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for(write_attempt)).await;
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "dead-letter store unavailable, stopping consumer");
                    self.health.record_error(channel, &e.to_string());
                    return false;
                }
            }
        }
        false
    }

    /// Durably advance the replay cursor. Returns false when persistence
    /// stays broken after retries; the consumer stops rather than continue
    /// past positions it cannot record.
    async fn advance_cursor(&self, channel: &Channel, position: ReplayPosition) -> bool {
        for attempt in 0..=self.config.max_retries {
            match self.cursors.advance(channel, position) {
                Ok(()) => return true,
                Err(e) if attempt < self.config.max_retries => {
                    warn!(channel = %channel, %position, error = %e, "cursor advance failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                }
                Err(e) => {
                    error!(
                        channel = %channel,
                        %position,
                        error = %e,
                        "cursor advance failed permanently, stopping consumer"
                    );
                    self.health.record_error(channel, &e.to_string());
                    return false;
                }
            }
        }
        false
    }
}
