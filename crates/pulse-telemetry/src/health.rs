use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use pulse_core::event::Channel;
use pulse_core::source::SourceState;

/// Per-channel operational status, consumed by an external health
/// component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelHealth {
    /// Current source state-machine state ("streaming", "polling", ...).
    pub state: String,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self {
            state: SourceState::Disconnected.as_str().to_string(),
            last_event_at: None,
            last_error: None,
        }
    }
}

/// Registry of per-channel health, shared across consumer tasks.
pub struct HealthRegistry {
    channels: RwLock<HashMap<Channel, ChannelHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_state(&self, channel: &Channel, state: SourceState) {
        let mut channels = self.channels.write();
        channels.entry(channel.clone()).or_default().state = state.as_str().to_string();
    }

    pub fn record_event(&self, channel: &Channel, occurred_at: DateTime<Utc>) {
        let mut channels = self.channels.write();
        channels.entry(channel.clone()).or_default().last_event_at = Some(occurred_at);
    }

    pub fn record_error(&self, channel: &Channel, error: &str) {
        let mut channels = self.channels.write();
        channels.entry(channel.clone()).or_default().last_error = Some(error.to_string());
    }

    pub fn get(&self, channel: &Channel) -> Option<ChannelHealth> {
        self.channels.read().get(channel).cloned()
    }

    /// Full snapshot keyed by channel name.
    pub fn snapshot(&self) -> HashMap<String, ChannelHealth> {
        self.channels
            .read()
            .iter()
            .map(|(c, h)| (c.as_str().to_string(), h.clone()))
            .collect()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chan() -> Channel {
        Channel::new("/data/TaskChangeEvent")
    }

    #[test]
    fn unknown_channel_is_none() {
        let reg = HealthRegistry::new();
        assert!(reg.get(&chan()).is_none());
    }

    #[test]
    fn state_transitions_recorded() {
        let reg = HealthRegistry::new();
        reg.set_state(&chan(), SourceState::Connecting);
        reg.set_state(&chan(), SourceState::Streaming);
        assert_eq!(reg.get(&chan()).unwrap().state, "streaming");
    }

    #[test]
    fn last_event_and_error_survive_state_change() {
        let reg = HealthRegistry::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        reg.record_event(&chan(), at);
        reg.record_error(&chan(), "connect refused");
        reg.set_state(&chan(), SourceState::Polling);

        let health = reg.get(&chan()).unwrap();
        assert_eq!(health.state, "polling");
        assert_eq!(health.last_event_at, Some(at));
        assert_eq!(health.last_error.as_deref(), Some("connect refused"));
    }

    #[test]
    fn snapshot_keyed_by_channel_name() {
        let reg = HealthRegistry::new();
        reg.set_state(&chan(), SourceState::Streaming);
        reg.set_state(&Channel::new("/data/LeadChangeEvent"), SourceState::Polling);

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["/data/TaskChangeEvent"].state, "streaming");
        assert_eq!(snap["/data/LeadChangeEvent"].state, "polling");
    }
}
