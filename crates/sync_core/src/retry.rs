use std::time::Duration;

/// Capped exponential backoff shared by reconnects, outbox retries and
/// checkpoint retries.
///
/// `failures` counts consecutive failures including the one just observed.
/// The first failure waits `base_delay`, each following one multiplies it,
/// and once `failures` exceeds `max_retries` the policy gives up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed, `0.0..=1.0`.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }

    /// Delay before the next attempt, without jitter.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Jittered delay, or `None` once the retry budget is spent.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if self.is_exhausted(failures) {
            return None;
        }
        Some(self.jittered(self.delay_for(failures)))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let scale = 1.0 - jitter + fastrand::f64() * 2.0 * jitter;
        delay.mul_f64(scale)
    }
}
