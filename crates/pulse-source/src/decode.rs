use chrono::{TimeZone, Utc};

use pulse_core::errors::PipelineError;
use pulse_core::event::{Channel, ChangeEvent, ChangeType, ObjectType, ReplayPosition};
use pulse_core::ids::RecordId;

use crate::transport::RawMessage;

/// Interpret a raw wire message as a change event.
///
/// The payload carries a `ChangeEventHeader` object describing what
/// changed; every other top-level key is a changed field value and is
/// kept verbatim in `fields`. Any structural defect produces a Decode
/// error carrying the replay position, so the caller can record the
/// failure and still move past it.
pub fn decode(channel: &Channel, raw: &RawMessage) -> Result<ChangeEvent, PipelineError> {
    let position = ReplayPosition::new(raw.replay_id);
    let fail = |detail: String| PipelineError::Decode {
        detail,
        position: Some(position),
    };

    let body = raw
        .payload
        .as_object()
        .ok_or_else(|| fail("payload is not an object".into()))?;

    let header = body
        .get("ChangeEventHeader")
        .and_then(|h| h.as_object())
        .ok_or_else(|| fail("missing ChangeEventHeader".into()))?;

    let entity = header
        .get("entityName")
        .and_then(|v| v.as_str())
        .ok_or_else(|| fail("header missing entityName".into()))?;
    let object_type = ObjectType::from_entity(entity)
        .ok_or_else(|| fail(format!("unrecognized entity {entity:?}")))?;

    let change_type = header
        .get("changeType")
        .and_then(|v| v.as_str())
        .and_then(ChangeType::from_raw)
        .ok_or_else(|| fail("header missing or unrecognized changeType".into()))?;

    let record_id = header
        .get("recordIds")
        .and_then(|v| v.as_array())
        .and_then(|ids| ids.first())
        .and_then(|v| v.as_str())
        .map(RecordId::from_raw)
        .ok_or_else(|| fail("header missing recordIds".into()))?;

    let commit_millis = header
        .get("commitTimestamp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| fail("header missing commitTimestamp".into()))?;
    let occurred_at = Utc
        .timestamp_millis_opt(commit_millis)
        .single()
        .ok_or_else(|| fail(format!("commitTimestamp out of range: {commit_millis}")))?;

    let mut fields = body.clone();
    fields.remove("ChangeEventHeader");

    Ok(ChangeEvent {
        channel: channel.clone(),
        object_type,
        change_type,
        record_id,
        occurred_at,
        replay_position: position,
        fields,
    })
}
