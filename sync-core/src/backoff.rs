//! Exponential backoff with jitter.
//!
//! Used for queue retries, realtime reconnects and schema check retries.
//! Jitter spreads out retries when many devices come back at once after a
//! remote store restart.

use std::time::Duration;

/// Exponential backoff policy: `min(max, base * 2^(attempt-1)) + random(0..=jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for the exponential part.
    pub max: Duration,
    /// Upper bound for the random part added on top.
    pub jitter: Duration,
}

impl Backoff {
    /// Create a policy.
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// Policy without jitter (deterministic, for tests and tight loops).
    pub fn without_jitter(base: Duration, max: Duration) -> Self {
        Self::new(base, max, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.random_jitter()
    }

    /// The exponential part only.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(20);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }

    fn random_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        let mut bytes = [0u8; 8];
        // No entropy source means no jitter, not a failed retry.
        if getrandom::getrandom(&mut bytes).is_err() {
            return Duration::ZERO;
        }
        Duration::from_millis(u64::from_le_bytes(bytes) % (jitter_ms + 1))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(30),
            Duration::from_millis(250),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let backoff = Backoff::without_jitter(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn attempt_zero_behaves_like_first_attempt() {
        let backoff = Backoff::without_jitter(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff::without_jitter(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_millis(500),
        );
        for _ in 0..50 {
            let delay = backoff.delay(4);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn jitter_creates_variance() {
        let backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        let delays: Vec<Duration> = (0..20).map(|_| backoff.delay(3)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "expected jitter variance, got min={:?} max={:?}",
            min,
            max
        );
    }
}
