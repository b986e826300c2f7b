//! Reconnect backoff: exponential with jitter, reset after a successful
//! handshake.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Backoff { config, attempt: 0 }
    }

    /// Clear the attempt counter.  Called after `auth_ok`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next reconnect attempt, jittered.
    pub fn next_delay(&mut self) -> Duration {
        let base = base_delay(&self.config, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        apply_jitter(base, self.config.jitter_pct, rand::thread_rng().gen())
    }
}

/// The un-jittered delay for the given attempt: `initial * factor^attempt`,
/// capped at the configured maximum.
fn base_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let factor = config.factor.powi(attempt.min(63) as i32);
    let millis = (config.initial.as_millis() as f64 * factor)
        .min(config.max.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

/// Scale `base` by a factor in `[1 - pct, 1 + pct]` driven by `unit` in
/// `[0, 1)`.
fn apply_jitter(base: Duration, jitter_pct: u8, unit: f64) -> Duration {
    let half_width = f64::from(jitter_pct) / 100.0;
    let scale = 1.0 - half_width + 2.0 * half_width * unit;
    Duration::from_millis((base.as_millis() as f64 * scale) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig::default()
    }

    #[test]
    fn base_delay_doubles_until_cap() {
        let cfg = config();
        assert_eq!(base_delay(&cfg, 0), Duration::from_secs(1));
        assert_eq!(base_delay(&cfg, 1), Duration::from_secs(2));
        assert_eq!(base_delay(&cfg, 2), Duration::from_secs(4));
        assert_eq!(base_delay(&cfg, 5), Duration::from_secs(32));
        // 2^6 = 64 s would exceed the 60 s cap.
        assert_eq!(base_delay(&cfg, 6), Duration::from_secs(60));
        assert_eq!(base_delay(&cfg, 20), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_secs(10);
        assert_eq!(apply_jitter(base, 20, 0.0), Duration::from_secs(8));
        assert_eq!(apply_jitter(base, 20, 0.5), Duration::from_secs(10));
        // unit is exclusive of 1.0, so the top of the band is approached
        // but the arithmetic at exactly 1.0 still bounds it.
        assert_eq!(apply_jitter(base, 20, 1.0), Duration::from_secs(12));
    }

    #[test]
    fn next_delay_grows_and_reset_starts_over() {
        let mut backoff = Backoff::new(config());
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        // Jitter bands for 1 s and 2 s do not overlap at ±20 %.
        assert!(first <= Duration::from_millis(1_200));
        assert!(second >= Duration::from_millis(1_600));

        backoff.reset();
        let after_reset = backoff.next_delay();
        assert!(after_reset <= Duration::from_millis(1_200));
    }

    #[test]
    fn delays_never_exceed_cap_plus_jitter() {
        let mut backoff = Backoff::new(config());
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next_delay();
        }
        assert!(last <= Duration::from_millis(72_000));
        assert!(last >= Duration::from_millis(48_000));
    }
}
