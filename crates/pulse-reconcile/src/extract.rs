use chrono::{DateTime, Utc};

use pulse_core::errors::PipelineError;
use pulse_core::event::{ChangeEvent, ChangeType, ObjectType};
use pulse_core::ids::{RecordId, ResponderId};
use pulse_core::state::ResponseSource;

/// Lead record id prefix. Tasks and messages can point at contacts,
/// accounts or opportunities; only lead-directed activity counts.
const LEAD_ID_PREFIX: &str = "00Q";

const QUALIFYING_TASK_TYPES: [&str; 3] = ["Call", "Email", "Meeting"];

/// A response observation distilled from one change event: who responded
/// to which lead, when, via what medium.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseCandidate {
    pub lead_id: RecordId,
    pub responder_id: ResponderId,
    pub occurred_at: DateTime<Utc>,
    pub source: ResponseSource,
}

/// Decide whether an event describes a response to a lead.
///
/// `Ok(None)` is the common case: the event is well formed but does not
/// qualify (wrong status, not lead-directed, a deletion). `Err` is
/// reserved for events that should qualify but are missing data they are
/// contractually required to carry.
pub fn extract_candidate(event: &ChangeEvent) -> Result<Option<ResponseCandidate>, PipelineError> {
    if event.change_type == ChangeType::Delete {
        return Ok(None);
    }
    match event.object_type {
        ObjectType::ResponseTask => extract_from_task(event),
        ObjectType::ResponseMessage => extract_from_message(event),
        ObjectType::LeadRecord => Ok(None),
    }
}

fn extract_from_task(event: &ChangeEvent) -> Result<Option<ResponseCandidate>, PipelineError> {
    if event.field_str("Status") != Some("Completed") {
        return Ok(None);
    }
    match event.field_str("Type") {
        Some(t) if QUALIFYING_TASK_TYPES.contains(&t) => {}
        _ => return Ok(None),
    }
    let lead_id = match lead_reference(event, "WhoId") {
        Some(id) => id,
        None => return Ok(None),
    };

    let occurred_at = event
        .field_datetime("CompletedDateTime")
        .or_else(|| event.field_datetime("CreatedDate"))
        .ok_or_else(|| {
            PipelineError::Extraction(format!(
                "completed task {} has no usable timestamp",
                event.record_id
            ))
        })?;
    let responder_id = event
        .field_str("OwnerId")
        .map(ResponderId::from_raw)
        .ok_or_else(|| {
            PipelineError::Extraction(format!("completed task {} has no OwnerId", event.record_id))
        })?;

    Ok(Some(ResponseCandidate {
        lead_id,
        responder_id,
        occurred_at,
        source: ResponseSource::Task,
    }))
}

fn extract_from_message(event: &ChangeEvent) -> Result<Option<ResponseCandidate>, PipelineError> {
    // Inbound mail is the lead talking to us, not a response.
    if event.fields.get("Incoming").and_then(|v| v.as_bool()) == Some(true) {
        return Ok(None);
    }
    let lead_id = match lead_reference(event, "RelatedToId") {
        Some(id) => id,
        None => return Ok(None),
    };

    let occurred_at = event
        .field_datetime("MessageDate")
        .or_else(|| event.field_datetime("CreatedDate"))
        .ok_or_else(|| {
            PipelineError::Extraction(format!(
                "message {} has no usable timestamp",
                event.record_id
            ))
        })?;
    let responder_id = event
        .field_str("CreatedById")
        .map(ResponderId::from_raw)
        .ok_or_else(|| {
            PipelineError::Extraction(format!("message {} has no CreatedById", event.record_id))
        })?;

    Ok(Some(ResponseCandidate {
        lead_id,
        responder_id,
        occurred_at,
        source: ResponseSource::Message,
    }))
}

fn lead_reference(event: &ChangeEvent, field: &str) -> Option<RecordId> {
    event
        .field_str(field)
        .filter(|id| id.starts_with(LEAD_ID_PREFIX))
        .map(RecordId::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_core::event::ReplayPosition;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn build(
        object_type: ObjectType,
        change_type: ChangeType,
        fields: serde_json::Value,
    ) -> ChangeEvent {
        ChangeEvent {
            channel: object_type.default_channel(),
            object_type,
            change_type,
            record_id: RecordId::from_raw("00T000000000001"),
            occurred_at: t0(),
            replay_position: ReplayPosition::new(1),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    fn completed_task() -> serde_json::Value {
        json!({
            "Status": "Completed",
            "Type": "Call",
            "WhoId": "00Q000000000001",
            "OwnerId": "005000000000001",
            "CompletedDateTime": "2026-03-01T09:20:00Z"
        })
    }

    #[test]
    fn qualified_task_extracts() {
        let event = build(ObjectType::ResponseTask, ChangeType::Update, completed_task());
        let c = extract_candidate(&event).unwrap().unwrap();
        assert_eq!(c.lead_id.as_str(), "00Q000000000001");
        assert_eq!(c.responder_id.as_str(), "005000000000001");
        assert_eq!(c.source, ResponseSource::Task);
        assert_eq!(c.occurred_at, t0() + chrono::Duration::minutes(20));
    }

    #[test]
    fn open_task_does_not_qualify() {
        let mut fields = completed_task();
        fields["Status"] = json!("In Progress");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        assert_eq!(extract_candidate(&event).unwrap(), None);
    }

    #[test]
    fn non_outreach_task_type_does_not_qualify() {
        let mut fields = completed_task();
        fields["Type"] = json!("Data Entry");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        assert_eq!(extract_candidate(&event).unwrap(), None);

        let mut fields = completed_task();
        fields.as_object_mut().unwrap().remove("Type");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        assert_eq!(extract_candidate(&event).unwrap(), None);
    }

    #[test]
    fn task_against_contact_does_not_qualify() {
        let mut fields = completed_task();
        fields["WhoId"] = json!("003000000000001");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        assert_eq!(extract_candidate(&event).unwrap(), None);

        let mut fields = completed_task();
        fields.as_object_mut().unwrap().remove("WhoId");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        assert_eq!(extract_candidate(&event).unwrap(), None);
    }

    #[test]
    fn deletions_never_qualify() {
        let event = build(ObjectType::ResponseTask, ChangeType::Delete, completed_task());
        assert_eq!(extract_candidate(&event).unwrap(), None);
    }

    #[test]
    fn lead_events_never_qualify() {
        let event = build(
            ObjectType::LeadRecord,
            ChangeType::Create,
            json!({"Status": "New"}),
        );
        assert_eq!(extract_candidate(&event).unwrap(), None);
    }

    #[test]
    fn task_timestamp_falls_back_to_created_date() {
        let mut fields = completed_task();
        fields.as_object_mut().unwrap().remove("CompletedDateTime");
        fields["CreatedDate"] = json!("2026-03-01T09:05:00Z");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        let c = extract_candidate(&event).unwrap().unwrap();
        assert_eq!(c.occurred_at, t0() + chrono::Duration::minutes(5));
    }

    #[test]
    fn qualified_task_without_timestamp_is_extraction_error() {
        let mut fields = completed_task();
        fields.as_object_mut().unwrap().remove("CompletedDateTime");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        assert!(matches!(
            extract_candidate(&event).unwrap_err(),
            PipelineError::Extraction(_)
        ));
    }

    #[test]
    fn qualified_task_without_owner_is_extraction_error() {
        let mut fields = completed_task();
        fields.as_object_mut().unwrap().remove("OwnerId");
        let event = build(ObjectType::ResponseTask, ChangeType::Update, fields);
        assert!(matches!(
            extract_candidate(&event).unwrap_err(),
            PipelineError::Extraction(_)
        ));
    }

    fn outbound_message() -> serde_json::Value {
        json!({
            "Incoming": false,
            "RelatedToId": "00Q000000000002",
            "CreatedById": "005000000000009",
            "MessageDate": "2026-03-01T09:50:00Z"
        })
    }

    #[test]
    fn outbound_message_extracts() {
        let event = build(ObjectType::ResponseMessage, ChangeType::Create, outbound_message());
        let c = extract_candidate(&event).unwrap().unwrap();
        assert_eq!(c.lead_id.as_str(), "00Q000000000002");
        assert_eq!(c.responder_id.as_str(), "005000000000009");
        assert_eq!(c.source, ResponseSource::Message);
        assert_eq!(c.occurred_at, t0() + chrono::Duration::minutes(50));
    }

    #[test]
    fn inbound_message_does_not_qualify() {
        let mut fields = outbound_message();
        fields["Incoming"] = json!(true);
        let event = build(ObjectType::ResponseMessage, ChangeType::Create, fields);
        assert_eq!(extract_candidate(&event).unwrap(), None);
    }

    #[test]
    fn message_unrelated_to_a_lead_does_not_qualify() {
        let mut fields = outbound_message();
        fields["RelatedToId"] = json!("001000000000001");
        let event = build(ObjectType::ResponseMessage, ChangeType::Create, fields);
        assert_eq!(extract_candidate(&event).unwrap(), None);
    }

    #[test]
    fn message_without_author_is_extraction_error() {
        let mut fields = outbound_message();
        fields.as_object_mut().unwrap().remove("CreatedById");
        let event = build(ObjectType::ResponseMessage, ChangeType::Create, fields);
        assert!(matches!(
            extract_candidate(&event).unwrap_err(),
            PipelineError::Extraction(_)
        ));
    }
}
