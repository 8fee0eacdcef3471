//! # Reconnection backoff.
//!
//! The delay before reconnection attempt `n` (1-based) is
//! `initial × factor^(n-1)`, clamped to `max`, then drawn uniformly from
//! `[delay/2, delay]`. The base delay depends only on the attempt number, so
//! jitter never feeds back into later attempts.
//!
//! With the defaults (1s, ×2, 30s cap) attempts 1..=5 have base delays of
//! 1, 2, 4, 8 and 16 seconds.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay before the first attempt.
    pub initial: Duration,
    /// Cap on the base delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
    /// Attempts allowed before giving up.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Base delay for `attempt` (1-based) before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay for `attempt`, drawn from `[base/2, base]`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if base <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rng.gen_range(base / 2.0..=base))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Whether `attempt` is past the retry ceiling.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }
}
