//! Exponential retry delays with jitter.

use rand::Rng;

use crate::config::SyncConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.base_backoff_ms, config.max_backoff_ms, config.jitter)
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// without jitter: base, 2·base, 4·base, ... capped at the maximum.
    pub fn base_delay_ms(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// Jittered delay, never above the maximum.
    pub fn delay_ms(&self, failures: u32) -> u64 {
        let base = self.base_delay_ms(failures);
        if base == 0 || self.jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = (base as f64 * (1.0 + spread)).round() as u64;
        jittered.min(self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let backoff = Backoff::new(2_000, 300_000, 0.0);
        assert_eq!(backoff.base_delay_ms(0), 0);
        assert_eq!(backoff.base_delay_ms(1), 2_000);
        assert_eq!(backoff.base_delay_ms(2), 4_000);
        assert_eq!(backoff.base_delay_ms(3), 8_000);
        assert_eq!(backoff.base_delay_ms(10), 300_000);
        assert_eq!(backoff.base_delay_ms(200), 300_000);
        assert_eq!(backoff.delay_ms(2), 4_000);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = Backoff::new(2_000, 300_000, 0.2);
        for _ in 0..200 {
            let d = backoff.delay_ms(2);
            assert!((3_200..=4_800).contains(&d), "got {}", d);
            assert!(backoff.delay_ms(30) <= 300_000);
        }
    }
}
