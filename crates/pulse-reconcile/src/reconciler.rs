use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use pulse_core::errors::PipelineError;
use pulse_core::event::ChangeEvent;
use pulse_core::handler::EventHandler;
use pulse_core::ids::RecordId;
use pulse_core::sink::{StateSink, WriteOutcome, WritePrecondition};
use pulse_core::state::{FirstResponseUpdate, ReconcileOutcome};
use pulse_telemetry::MetricsRecorder;

use crate::extract::extract_candidate;

/// Cache entries are cheap (id + timestamp), but leads keep arriving for
/// the life of the process. Past this bound the cache is dropped
/// wholesale rather than evicted per entry.
const SEEN_CACHE_MAX: usize = 100_000;

/// Maintains each lead's time-to-first-response summary under an
/// earliest-wins rule.
///
/// Replay-safe by construction: the decision to write is delegated to the
/// sink's conditional write, so consuming the same event twice, or two
/// events out of order, converges on the earliest response either way.
pub struct FirstResponseReconciler {
    sink: Arc<dyn StateSink>,
    metrics: Arc<MetricsRecorder>,
    /// Last stored `first_responded_at` seen per record. Only ever used to
    /// short-circuit obvious discards; every acceptance still goes through
    /// the sink's precondition.
    seen_responses: DashMap<RecordId, DateTime<Utc>>,
}

impl FirstResponseReconciler {
    pub fn new(sink: Arc<dyn StateSink>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            sink,
            metrics,
            seen_responses: DashMap::new(),
        }
    }

    /// The cache is advisory only, so clearing it at the bound is always
    /// safe; the next pass for any lead falls back to a sink read.
    fn remember(&self, lead_id: &RecordId, stored: DateTime<Utc>) {
        if self.seen_responses.len() >= SEEN_CACHE_MAX {
            self.seen_responses.clear();
        }
        self.seen_responses.insert(lead_id.clone(), stored);
    }

    fn record_outcome(&self, outcome: ReconcileOutcome, source: &str) {
        self.metrics.counter_inc(
            "reconcile_total",
            &[("outcome", outcome.as_str()), ("source", source)],
            1,
        );
    }
}

#[async_trait]
impl EventHandler for FirstResponseReconciler {
    fn name(&self) -> &str {
        "first_response_reconciler"
    }

    #[instrument(skip(self, event), fields(record_id = %event.record_id, position = %event.replay_position))]
    async fn handle(&self, event: &ChangeEvent) -> Result<(), PipelineError> {
        let candidate = match extract_candidate(event)? {
            Some(candidate) => candidate,
            None => {
                debug!(object_type = %event.object_type, "event does not qualify as a response");
                return Ok(());
            }
        };
        let source = candidate.source.as_str();

        if let Some(stored) = self.seen_responses.get(&candidate.lead_id) {
            if candidate.occurred_at >= *stored {
                debug!(lead_id = %candidate.lead_id, "not earlier than a response already stored");
                self.record_outcome(ReconcileOutcome::DiscardedNotEarlier, source);
                return Ok(());
            }
        }

        let state = match self.sink.read_state(&candidate.lead_id).await? {
            Some(state) => state,
            None => {
                // The lead may have been deleted or merged since the
                // activity was logged; nothing to reconcile against.
                warn!(lead_id = %candidate.lead_id, "lead not present at sink, dropping candidate");
                self.metrics
                    .counter_inc("reconcile_missing_lead_total", &[("source", source)], 1);
                return Ok(());
            }
        };

        if !state.would_accept(candidate.occurred_at) {
            if let Some(stored) = state.first_responded_at {
                self.remember(&candidate.lead_id, stored);
            }
            self.record_outcome(ReconcileOutcome::DiscardedNotEarlier, source);
            return Ok(());
        }

        let update = FirstResponseUpdate::for_candidate(
            state.created_at,
            candidate.occurred_at,
            candidate.responder_id.clone(),
            candidate.source,
        );
        let minutes = update.minutes_to_first_response;

        match self
            .sink
            .conditional_write(
                &candidate.lead_id,
                update,
                WritePrecondition::IfEarlierThanStored,
            )
            .await?
        {
            WriteOutcome::Applied => {
                info!(
                    lead_id = %candidate.lead_id,
                    responder_id = %candidate.responder_id,
                    source,
                    minutes,
                    "first response recorded"
                );
                self.remember(&candidate.lead_id, candidate.occurred_at);
                self.record_outcome(ReconcileOutcome::Applied, source);
                self.metrics.histogram_observe(
                    "first_response_minutes",
                    &[("source", source)],
                    minutes as f64,
                );
            }
            WriteOutcome::Rejected => {
                // Lost a race against a concurrent, earlier write.
                debug!(lead_id = %candidate.lead_id, "sink rejected write, earlier response already stored");
                self.record_outcome(ReconcileOutcome::DiscardedNotEarlier, source);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_core::event::{ChangeType, ObjectType, ReplayPosition};
    use pulse_core::state::ResponseSource;
    use serde_json::json;

    use crate::memory::MemorySink;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn lead_id() -> RecordId {
        RecordId::from_raw("00Q000000000001")
    }

    fn task_event(position: i64, minutes_after_t0: i64) -> ChangeEvent {
        let at = (t0() + chrono::Duration::minutes(minutes_after_t0)).to_rfc3339();
        ChangeEvent {
            channel: ObjectType::ResponseTask.default_channel(),
            object_type: ObjectType::ResponseTask,
            change_type: ChangeType::Update,
            record_id: RecordId::from_raw(format!("00T{position:012}")),
            occurred_at: t0(),
            replay_position: ReplayPosition::new(position),
            fields: json!({
                "Status": "Completed",
                "Type": "Call",
                "WhoId": "00Q000000000001",
                "OwnerId": "005000000000001",
                "CompletedDateTime": at
            })
            .as_object()
            .cloned()
            .unwrap(),
        }
    }

    fn message_event(position: i64, minutes_after_t0: i64) -> ChangeEvent {
        let at = (t0() + chrono::Duration::minutes(minutes_after_t0)).to_rfc3339();
        ChangeEvent {
            channel: ObjectType::ResponseMessage.default_channel(),
            object_type: ObjectType::ResponseMessage,
            change_type: ChangeType::Create,
            record_id: RecordId::from_raw(format!("02s{position:012}")),
            occurred_at: t0(),
            replay_position: ReplayPosition::new(position),
            fields: json!({
                "Incoming": false,
                "RelatedToId": "00Q000000000001",
                "CreatedById": "005000000000002",
                "MessageDate": at
            })
            .as_object()
            .cloned()
            .unwrap(),
        }
    }

    fn setup() -> (Arc<MemorySink>, FirstResponseReconciler, Arc<MetricsRecorder>) {
        let sink = Arc::new(MemorySink::new());
        sink.register_record(lead_id(), t0());
        let metrics = Arc::new(MetricsRecorder::new());
        let reconciler = FirstResponseReconciler::new(
            Arc::clone(&sink) as Arc<dyn StateSink>,
            Arc::clone(&metrics),
        );
        (sink, reconciler, metrics)
    }

    #[tokio::test]
    async fn first_response_sets_all_four_attributes() {
        let (sink, reconciler, metrics) = setup();
        reconciler.handle(&task_event(1, 20)).await.unwrap();

        let state = sink.get(&lead_id()).unwrap();
        assert_eq!(
            state.first_responded_at,
            Some(t0() + chrono::Duration::minutes(20))
        );
        assert_eq!(state.responder_id.unwrap().as_str(), "005000000000001");
        assert_eq!(state.response_source, Some(ResponseSource::Task));
        assert_eq!(state.minutes_to_first_response, Some(20));
        assert_eq!(
            metrics.counter_get("reconcile_total", &[("outcome", "applied"), ("source", "task")]),
            1
        );
        let summary = metrics.histogram_summary("first_response_minutes", &[("source", "task")]);
        assert_eq!(summary.count, 1);
    }

    #[tokio::test]
    async fn later_message_then_earlier_task_converges_on_task() {
        let (sink, reconciler, _) = setup();
        reconciler.handle(&message_event(1, 50)).await.unwrap();
        reconciler.handle(&task_event(2, 20)).await.unwrap();

        let state = sink.get(&lead_id()).unwrap();
        assert_eq!(
            state.first_responded_at,
            Some(t0() + chrono::Duration::minutes(20))
        );
        assert_eq!(state.response_source, Some(ResponseSource::Task));
        assert_eq!(state.minutes_to_first_response, Some(20));
    }

    #[tokio::test]
    async fn earlier_task_then_later_message_converges_identically() {
        let (sink, reconciler, metrics) = setup();
        reconciler.handle(&task_event(1, 20)).await.unwrap();
        reconciler.handle(&message_event(2, 50)).await.unwrap();

        let state = sink.get(&lead_id()).unwrap();
        assert_eq!(state.response_source, Some(ResponseSource::Task));
        assert_eq!(state.minutes_to_first_response, Some(20));
        assert_eq!(
            metrics.counter_get(
                "reconcile_total",
                &[("outcome", "discarded_not_earlier"), ("source", "message")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn replaying_the_same_event_is_idempotent() {
        let (sink, reconciler, metrics) = setup();
        let event = task_event(1, 20);
        reconciler.handle(&event).await.unwrap();
        let before = sink.get(&lead_id()).unwrap();

        reconciler.handle(&event).await.unwrap();
        let after = sink.get(&lead_id()).unwrap();

        assert_eq!(before.first_responded_at, after.first_responded_at);
        assert_eq!(before.responder_id, after.responder_id);
        assert_eq!(
            metrics.counter_get("reconcile_total", &[("outcome", "applied"), ("source", "task")]),
            1
        );
    }

    #[tokio::test]
    async fn discard_cache_skips_the_sink_round_trip() {
        let (sink, reconciler, _) = setup();
        reconciler.handle(&task_event(1, 20)).await.unwrap();
        let reads_after_apply = sink.read_count();

        // Later candidate for the same lead: discarded from the cache
        reconciler.handle(&message_event(2, 50)).await.unwrap();
        assert_eq!(sink.read_count(), reads_after_apply);
        assert_eq!(sink.get(&lead_id()).unwrap().minutes_to_first_response, Some(20));
    }

    #[tokio::test]
    async fn non_qualifying_events_never_touch_the_sink() {
        let (sink, reconciler, _) = setup();
        let mut event = task_event(1, 20);
        event.fields.insert("Status".into(), json!("In Progress"));

        reconciler.handle(&event).await.unwrap();
        assert_eq!(sink.read_count(), 0);
        assert_eq!(sink.write_count(), 0);
    }

    #[tokio::test]
    async fn unknown_lead_drops_candidate_without_error() {
        let sink = Arc::new(MemorySink::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let reconciler = FirstResponseReconciler::new(
            Arc::clone(&sink) as Arc<dyn StateSink>,
            Arc::clone(&metrics),
        );

        reconciler.handle(&task_event(1, 20)).await.unwrap();
        assert_eq!(
            metrics.counter_get("reconcile_missing_lead_total", &[("source", "task")]),
            1
        );
        assert_eq!(sink.write_count(), 0);
    }

    #[tokio::test]
    async fn discard_cache_is_dropped_at_its_bound() {
        let (sink, reconciler, _) = setup();
        for i in 0..SEEN_CACHE_MAX {
            reconciler
                .seen_responses
                .insert(RecordId::from_raw(format!("00Z{i:012}")), t0());
        }

        reconciler.handle(&task_event(1, 20)).await.unwrap();

        assert!(reconciler.seen_responses.len() <= SEEN_CACHE_MAX);
        assert_eq!(
            sink.get(&lead_id()).unwrap().minutes_to_first_response,
            Some(20)
        );
    }

    #[tokio::test]
    async fn sink_outage_propagates_as_retryable() {
        let (sink, reconciler, _) = setup();
        sink.fail_next(PipelineError::SinkUnavailable("503".into()));

        let err = reconciler.handle(&task_event(1, 20)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn concurrent_candidates_converge_on_the_earliest() {
        let sink = Arc::new(MemorySink::new());
        sink.register_record(lead_id(), t0());
        let metrics = Arc::new(MetricsRecorder::new());

        // Two reconcilers racing on the same sink, as two channel
        // consumers would
        let r1 = Arc::new(FirstResponseReconciler::new(
            Arc::clone(&sink) as Arc<dyn StateSink>,
            Arc::clone(&metrics),
        ));
        let r2 = Arc::new(FirstResponseReconciler::new(
            Arc::clone(&sink) as Arc<dyn StateSink>,
            Arc::clone(&metrics),
        ));

        let a = {
            let r1 = Arc::clone(&r1);
            tokio::spawn(async move { r1.handle(&task_event(1, 20)).await })
        };
        let b = {
            let r2 = Arc::clone(&r2);
            tokio::spawn(async move { r2.handle(&message_event(2, 50)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let state = sink.get(&lead_id()).unwrap();
        assert_eq!(state.minutes_to_first_response, Some(20));
        assert_eq!(state.response_source, Some(ResponseSource::Task));
    }
}
