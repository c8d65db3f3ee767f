//! Exponential backoff with centered jitter.
//!
//! Pure math only; the cancellable timer that waits out a delay lives in
//! `lifeline-client`.
//!
//! ```text
//! delay  = min(initial * multiplier^attempt, max)
//! jitter = delay * jitter_ratio * (random - 0.5)
//! actual = max(delay + jitter, 0)
//! ```
//!
//! `attempt` is zero-based. `actual` never exceeds `max * (1 + jitter_ratio / 2)`.

use std::time::Duration;

/// Backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt (expected `>= 1.0`).
    pub multiplier: f64,
    /// Jitter span as a fraction of the delay (expected in `[0, 1]`).
    pub jitter_ratio: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

impl Backoff {
    /// Capped delay for `attempt` before jitter is applied.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = duration_ms(self.initial_delay);
        let max_ms = duration_ms(self.max_delay);
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = initial_ms * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        from_ms(capped)
    }

    /// Delay for `attempt` with jitter drawn from `random` in `[0, 1]`.
    #[must_use]
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let base_ms = duration_ms(self.base_delay(attempt));
        let random = if random.is_finite() { random.clamp(0.0, 1.0) } else { 0.5 };
        let jitter_ms = base_ms * self.jitter_ratio * (random - 0.5);
        from_ms(base_ms + jitter_ms)
    }

    /// Delay for `attempt` with jitter drawn from the thread RNG.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// Lower and upper bound of the jittered delay for `attempt`.
    #[must_use]
    pub fn jitter_bounds(&self, attempt: u32) -> (Duration, Duration) {
        (
            self.delay_with_random(attempt, 0.0),
            self.delay_with_random(attempt, 1.0),
        )
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn from_ms(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}
