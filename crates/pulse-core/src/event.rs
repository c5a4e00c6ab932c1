use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::RecordId;

/// A named logical stream of change events for one object type.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque, per-channel, totally ordered marker identifying a point in the
/// event stream. Only the source that minted it assigns meaning to the
/// value; consumers may only compare and persist it.
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ReplayPosition(i64);

impl ReplayPosition {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The business objects the pipeline observes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    LeadRecord,
    ResponseTask,
    ResponseMessage,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadRecord => "lead_record",
            Self::ResponseTask => "response_task",
            Self::ResponseMessage => "response_message",
        }
    }

    /// Map the transport's entity name onto the enumerated tag.
    pub fn from_entity(entity: &str) -> Option<Self> {
        match entity {
            "Lead" => Some(Self::LeadRecord),
            "Task" => Some(Self::ResponseTask),
            "EmailMessage" => Some(Self::ResponseMessage),
            _ => None,
        }
    }

    /// The conventional channel carrying this object's change events.
    pub fn default_channel(&self) -> Channel {
        match self {
            Self::LeadRecord => Channel::new("/data/LeadChangeEvent"),
            Self::ResponseTask => Channel::new("/data/TaskChangeEvent"),
            Self::ResponseMessage => Channel::new("/data/EmailMessageChangeEvent"),
        }
    }

    /// Whether events of this type can qualify as a first response.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::ResponseTask | Self::ResponseMessage)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of mutation an event describes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed mutation, decoded from the raw transport message.
/// Immutable once constructed; retries re-consume the same value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub channel: Channel,
    pub object_type: ObjectType,
    pub change_type: ChangeType,
    pub record_id: RecordId,
    /// Source-side commit time, not ingestion time.
    pub occurred_at: DateTime<Utc>,
    pub replay_position: ReplayPosition,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ChangeEvent {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    /// Parse a field as an RFC 3339 timestamp or epoch milliseconds.
    pub fn field_datetime(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.fields.get(name)? {
            serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            serde_json::Value::Number(n) => {
                let millis = n.as_i64()?;
                Utc.timestamp_millis_opt(millis).single()
            }
            _ => None,
        }
    }
}
