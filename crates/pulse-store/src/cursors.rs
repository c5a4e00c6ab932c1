use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use pulse_core::event::{Channel, ReplayPosition};

use crate::database::Database;
use crate::error::StoreError;

/// Durable replay position for one channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayCursor {
    pub channel: Channel,
    pub last_position: ReplayPosition,
    pub last_advanced_at: DateTime<Utc>,
}

/// Persistence of the last processed position per channel.
///
/// Same-channel callers must serialize their own `advance` calls (the
/// dispatcher owns one consumer per channel); different channels may
/// advance concurrently. The UPSERT carries a monotonic guard so a late
/// or replayed write can never move a cursor backward.
pub struct CursorRepo {
    db: Database,
}

impl CursorRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Last durably recorded position, or None if the channel has never
    /// been processed.
    #[instrument(skip(self), fields(channel = %channel))]
    pub fn load(&self, channel: &Channel) -> Result<Option<ReplayCursor>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT position, advanced_at FROM cursors WHERE channel = ?1")?;
            let mut rows = stmt.query([channel.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let position: i64 = row.get(0)?;
                    let advanced_at: String = row.get(1)?;
                    let advanced_at = DateTime::parse_from_rfc3339(&advanced_at)
                        .map_err(|e| StoreError::Serialization(format!("advanced_at: {e}")))?
                        .with_timezone(&Utc);
                    Ok(Some(ReplayCursor {
                        channel: channel.clone(),
                        last_position: ReplayPosition::new(position),
                        last_advanced_at: advanced_at,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    /// Persist `position` as the new cursor for `channel`. A position at
    /// or before the stored one is a no-op, never an error.
    #[instrument(skip(self), fields(channel = %channel, position = %position))]
    pub fn advance(
        &self,
        channel: &Channel,
        position: ReplayPosition,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cursors (channel, position, advanced_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(channel) DO UPDATE SET
                     position = excluded.position,
                     advanced_at = excluded.advanced_at
                 WHERE excluded.position >= cursors.position",
                rusqlite::params![channel.as_str(), position.as_i64(), now],
            )?;
            Ok(())
        })
    }

    /// Clear the stored position. Operator-triggered reprocessing only.
    #[instrument(skip(self), fields(channel = %channel))]
    pub fn reset(&self, channel: &Channel) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM cursors WHERE channel = ?1",
                [channel.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// All cursors, for health reporting.
    pub fn load_all(&self) -> Result<Vec<ReplayCursor>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT channel, position, advanced_at FROM cursors ORDER BY channel")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let channel: String = row.get(0)?;
                let position: i64 = row.get(1)?;
                let advanced_at: String = row.get(2)?;
                out.push(ReplayCursor {
                    channel: Channel::new(channel),
                    last_position: ReplayPosition::new(position),
                    last_advanced_at: DateTime::parse_from_rfc3339(&advanced_at)
                        .map_err(|e| StoreError::Serialization(format!("advanced_at: {e}")))?
                        .with_timezone(&Utc),
                });
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> CursorRepo {
        CursorRepo::new(Database::in_memory().unwrap())
    }

    fn chan() -> Channel {
        Channel::new("/data/TaskChangeEvent")
    }

    #[test]
    fn load_missing_is_none() {
        let repo = repo();
        assert!(repo.load(&chan()).unwrap().is_none());
    }

    #[test]
    fn advance_then_load() {
        let repo = repo();
        repo.advance(&chan(), ReplayPosition::new(5)).unwrap();
        let cursor = repo.load(&chan()).unwrap().unwrap();
        assert_eq!(cursor.last_position, ReplayPosition::new(5));
        assert_eq!(cursor.channel, chan());
    }

    #[test]
    fn advance_is_monotonic() {
        let repo = repo();
        repo.advance(&chan(), ReplayPosition::new(10)).unwrap();
        // A stale write must not roll the cursor back
        repo.advance(&chan(), ReplayPosition::new(3)).unwrap();
        let cursor = repo.load(&chan()).unwrap().unwrap();
        assert_eq!(cursor.last_position, ReplayPosition::new(10));

        repo.advance(&chan(), ReplayPosition::new(11)).unwrap();
        let cursor = repo.load(&chan()).unwrap().unwrap();
        assert_eq!(cursor.last_position, ReplayPosition::new(11));
    }

    #[test]
    fn advance_same_position_is_noop() {
        let repo = repo();
        repo.advance(&chan(), ReplayPosition::new(7)).unwrap();
        repo.advance(&chan(), ReplayPosition::new(7)).unwrap();
        let cursor = repo.load(&chan()).unwrap().unwrap();
        assert_eq!(cursor.last_position, ReplayPosition::new(7));
    }

    #[test]
    fn channels_are_independent() {
        let repo = repo();
        let lead = Channel::new("/data/LeadChangeEvent");
        repo.advance(&chan(), ReplayPosition::new(100)).unwrap();
        repo.advance(&lead, ReplayPosition::new(1)).unwrap();

        assert_eq!(
            repo.load(&chan()).unwrap().unwrap().last_position,
            ReplayPosition::new(100)
        );
        assert_eq!(
            repo.load(&lead).unwrap().unwrap().last_position,
            ReplayPosition::new(1)
        );
    }

    #[test]
    fn reset_clears_cursor() {
        let repo = repo();
        repo.advance(&chan(), ReplayPosition::new(5)).unwrap();
        assert!(repo.reset(&chan()).unwrap());
        assert!(repo.load(&chan()).unwrap().is_none());
        // Resetting again reports nothing deleted
        assert!(!repo.reset(&chan()).unwrap());
    }

    #[test]
    fn load_all_sorted_by_channel() {
        let repo = repo();
        repo.advance(&Channel::new("/data/TaskChangeEvent"), ReplayPosition::new(2))
            .unwrap();
        repo.advance(&Channel::new("/data/LeadChangeEvent"), ReplayPosition::new(1))
            .unwrap();

        let all = repo.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].channel.as_str(), "/data/LeadChangeEvent");
        assert_eq!(all[1].channel.as_str(), "/data/TaskChangeEvent");
    }

    #[test]
    fn cursor_survives_reopen() {
        let dir =
            std::env::temp_dir().join(format!("pulse-cursor-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join("cursors.db");

        {
            let repo = CursorRepo::new(Database::open(&path).unwrap());
            repo.advance(&chan(), ReplayPosition::new(42)).unwrap();
        }

        // Simulated restart: a fresh connection sees the durable cursor
        let repo = CursorRepo::new(Database::open(&path).unwrap());
        let cursor = repo.load(&chan()).unwrap().unwrap();
        assert_eq!(cursor.last_position, ReplayPosition::new(42));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
