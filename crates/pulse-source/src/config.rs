use std::time::Duration;

/// Tuning for the event source's connection lifecycle. All operational
/// parameters: none of these affect what the stream delivers, only how it
/// survives transport trouble.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Bound on each subscribe attempt.
    pub connect_timeout: Duration,
    /// Consecutive connect/stream failures before degrading to polling.
    pub fallback_threshold: u32,
    /// Backoff base for reconnect attempts.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay.
    pub jitter_factor: f64,
    /// How often the polling fallback fetches changes.
    pub poll_interval: Duration,
    /// Max records per poll fetch.
    pub poll_batch_limit: u32,
    /// How often polling mode re-probes the push transport.
    pub reprobe_interval: Duration,
    /// Never attempt the push transport (operator override).
    pub poll_only: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            fallback_threshold: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            poll_interval: Duration::from_secs(60),
            poll_batch_limit: 100,
            reprobe_interval: Duration::from_secs(300),
            poll_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SourceConfig::default();
        assert_eq!(config.fallback_threshold, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.reprobe_interval, Duration::from_secs(300));
        assert!(!config.poll_only);
    }
}
