use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use pulse_core::event::{Channel, ChangeEvent, ReplayPosition};
use pulse_core::ids::DeadLetterId;

use crate::database::Database;
use crate::error::StoreError;

/// An event that exhausted its retries, parked so the channel can move on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub id: DeadLetterId,
    pub channel: Channel,
    pub object_type: String,
    pub change_type: String,
    pub record_id: String,
    pub position: ReplayPosition,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: u32,
    pub created_at: String,
}

pub struct DeadLetterRepo {
    db: Database,
}

impl DeadLetterRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Park a failed event with the error that exhausted it.
    #[instrument(skip(self, event), fields(channel = %event.channel, record_id = %event.record_id))]
    pub fn insert(
        &self,
        event: &ChangeEvent,
        error: &str,
        attempts: u32,
    ) -> Result<DeadLetterRow, StoreError> {
        let id = DeadLetterId::new();
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::Value::Object(event.fields.clone());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dead_letters
                     (id, channel, object_type, change_type, record_id, position, payload, error, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    event.channel.as_str(),
                    event.object_type.as_str(),
                    event.change_type.as_str(),
                    event.record_id.as_str(),
                    event.replay_position.as_i64(),
                    serde_json::to_string(&payload)?,
                    error,
                    attempts,
                    now,
                ],
            )?;

            Ok(DeadLetterRow {
                id: id.clone(),
                channel: event.channel.clone(),
                object_type: event.object_type.as_str().to_string(),
                change_type: event.change_type.as_str().to_string(),
                record_id: event.record_id.as_str().to_string(),
                position: event.replay_position,
                payload: payload.clone(),
                error: error.to_string(),
                attempts,
                created_at: now.clone(),
            })
        })
    }

    /// List parked events, newest first.
    pub fn list(
        &self,
        channel: Option<&Channel>,
        limit: u32,
    ) -> Result<Vec<DeadLetterRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, param): (String, Option<String>) = match channel {
                Some(c) => (
                    "SELECT id, channel, object_type, change_type, record_id, position, payload, error, attempts, created_at
                     FROM dead_letters WHERE channel = ?1 ORDER BY created_at DESC LIMIT ?2"
                        .into(),
                    Some(c.as_str().to_string()),
                ),
                None => (
                    "SELECT id, channel, object_type, change_type, record_id, position, payload, error, attempts, created_at
                     FROM dead_letters ORDER BY created_at DESC LIMIT ?1"
                        .into(),
                    None,
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match &param {
                Some(c) => stmt.query(rusqlite::params![c, limit])?,
                None => stmt.query(rusqlite::params![limit])?,
            };

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row.get(6)?;
                out.push(DeadLetterRow {
                    id: DeadLetterId::from_raw(row.get::<_, String>(0)?),
                    channel: Channel::new(row.get::<_, String>(1)?),
                    object_type: row.get(2)?,
                    change_type: row.get(3)?,
                    record_id: row.get(4)?,
                    position: ReplayPosition::new(row.get(5)?),
                    payload: serde_json::from_str(&payload)?,
                    error: row.get(7)?,
                    attempts: row.get(8)?,
                    created_at: row.get(9)?,
                });
            }
            Ok(out)
        })
    }

    pub fn count(&self, channel: Option<&Channel>) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = match channel {
                Some(c) => conn.query_row(
                    "SELECT COUNT(*) FROM dead_letters WHERE channel = ?1",
                    [c.as_str()],
                    |row| row.get(0),
                )?,
                None => {
                    conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?
                }
            };
            Ok(count as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_core::event::{ChangeType, ObjectType};
    use pulse_core::ids::RecordId;

    fn event(position: i64) -> ChangeEvent {
        ChangeEvent {
            channel: Channel::new("/data/TaskChangeEvent"),
            object_type: ObjectType::ResponseTask,
            change_type: ChangeType::Create,
            record_id: RecordId::from_raw("00T000000000001"),
            occurred_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            replay_position: ReplayPosition::new(position),
            fields: serde_json::json!({"WhoId": "00Q000000000001"})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    #[test]
    fn insert_and_count() {
        let repo = DeadLetterRepo::new(Database::in_memory().unwrap());
        assert_eq!(repo.count(None).unwrap(), 0);

        let row = repo.insert(&event(5), "sink unavailable: 503", 4).unwrap();
        assert!(row.id.as_str().starts_with("dlq_"));
        assert_eq!(row.attempts, 4);
        assert_eq!(repo.count(None).unwrap(), 1);
    }

    #[test]
    fn list_filters_by_channel() {
        let repo = DeadLetterRepo::new(Database::in_memory().unwrap());
        repo.insert(&event(1), "err", 1).unwrap();

        let mut other = event(2);
        other.channel = Channel::new("/data/EmailMessageChangeEvent");
        repo.insert(&other, "err", 1).unwrap();

        let task_only = repo
            .list(Some(&Channel::new("/data/TaskChangeEvent")), 10)
            .unwrap();
        assert_eq!(task_only.len(), 1);
        assert_eq!(task_only[0].channel.as_str(), "/data/TaskChangeEvent");

        let all = repo.list(None, 10).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn payload_preserves_event_fields() {
        let repo = DeadLetterRepo::new(Database::in_memory().unwrap());
        repo.insert(&event(3), "extraction failed", 1).unwrap();

        let rows = repo.list(None, 10).unwrap();
        assert_eq!(rows[0].payload["WhoId"], "00Q000000000001");
        assert_eq!(rows[0].position, ReplayPosition::new(3));
    }

    #[test]
    fn count_per_channel() {
        let repo = DeadLetterRepo::new(Database::in_memory().unwrap());
        repo.insert(&event(1), "err", 1).unwrap();
        repo.insert(&event(2), "err", 1).unwrap();

        let chan = Channel::new("/data/TaskChangeEvent");
        assert_eq!(repo.count(Some(&chan)).unwrap(), 2);
        assert_eq!(
            repo.count(Some(&Channel::new("/data/LeadChangeEvent")))
                .unwrap(),
            0
        );
    }
}
