use std::time::Duration;

use crate::config::SourceConfig;

/// Exponential backoff with jitter for reconnect attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.jitter_factor)
    }

    /// Delay before the given attempt (0-based): base * 2^attempt, capped,
    /// with ± jitter_factor of randomization. Never below 100ms.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        let final_ms = (capped + jitter).max(100.0);

        Duration::from_millis(final_ms as u64)
    }
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_without_jitter() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 0.0);
        assert_eq!(backoff.delay_for(0).as_millis(), 100);
        assert_eq!(backoff.delay_for(1).as_millis(), 200);
        assert_eq!(backoff.delay_for(2).as_millis(), 400);
    }

    #[test]
    fn capped_at_max() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 0.0);
        // 1s * 2^10 = 1024s, capped at 5s
        assert_eq!(backoff.delay_for(10).as_millis(), 5000);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.2);
        for attempt in 0..5 {
            let base = (1000.0 * 2.0_f64.powi(attempt)).min(30_000.0);
            let delay = backoff.delay_for(attempt as u32).as_millis() as f64;
            assert!(delay >= base * 0.8 - 1.0, "attempt {attempt}: {delay} too low");
            assert!(delay <= base * 1.2 + 1.0, "attempt {attempt}: {delay} too high");
        }
    }

    #[test]
    fn floor_of_100ms() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(1), 0.0);
        assert_eq!(backoff.delay_for(0).as_millis(), 100);
    }
}
