use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Upper bound on reconnection attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxAttempts {
    Unbounded,
    Limited(u32),
}

impl MaxAttempts {
    /// `-1` (or any negative value) means retry forever.
    pub fn from_signed(value: i64) -> Self {
        if value < 0 {
            MaxAttempts::Unbounded
        } else {
            MaxAttempts::Limited(value.min(u32::MAX as i64) as u32)
        }
    }
}

/// Outcome of registering one more failed connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Exponential backoff reconnect controller.
///
/// `delay(n) = min(base * 2^(n-1), max)`. The controller itself is deterministic; any jitter is
/// applied by the caller when it schedules the sleep.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    max_attempts: MaxAttempts,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, max_attempts: MaxAttempts) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the given attempt number. Attempts 0 and 1 both yield `base`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Clamp the exponent so the shift stays in range; the u128 product saturates.
        let exponent = attempt.saturating_sub(1).min(63);
        let nanos = self.base.as_nanos().saturating_mul(1u128 << exponent);
        if nanos >= self.max.as_nanos() {
            return self.max;
        }
        Duration::new(
            (nanos / 1_000_000_000) as u64,
            (nanos % 1_000_000_000) as u32,
        )
    }

    /// Register a failure and decide whether (and when) to try again.
    pub fn on_failure(&mut self) -> RetryDecision {
        let attempt = self.attempt.saturating_add(1);
        if let MaxAttempts::Limited(limit) = self.max_attempts
            && attempt > limit
        {
            return RetryDecision::Exhausted {
                attempts: self.attempt,
            };
        }
        self.attempt = attempt;
        RetryDecision::Retry {
            attempt,
            delay: self.delay_for_attempt(attempt),
        }
    }

    /// Called when a connection reaches streaming.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(300),
            MaxAttempts::Unbounded,
        )
    }
}

/// Scale a delay by a random factor in `[0.5, 1.0]`.
pub fn jitter_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range(0.5..=1.0);
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(300),
            MaxAttempts::Unbounded,
        )
    }

    #[test]
    fn first_attempts_use_base_delay() {
        let b = backoff();
        assert_eq!(b.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(b.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(b.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(b.delay_for_attempt(5), Duration::from_secs(16));
    }

    #[test]
    fn delay_is_monotonic_and_capped() {
        let b = backoff();
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = b.delay_for_attempt(attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            assert!(delay <= Duration::from_secs(300));
            previous = delay;
        }
        // 2^8 = 256s < 300s < 2^9
        assert_eq!(b.delay_for_attempt(9), Duration::from_secs(256));
        for attempt in 10..100 {
            assert_eq!(b.delay_for_attempt(attempt), Duration::from_secs(300));
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let b = backoff();
        assert_eq!(b.delay_for_attempt(64), Duration::from_secs(300));
        assert_eq!(b.delay_for_attempt(u32::MAX), Duration::from_secs(300));

        let uncapped = ExponentialBackoff::new(
            Duration::from_secs(u64::MAX / 4),
            Duration::MAX,
            MaxAttempts::Unbounded,
        );
        assert_eq!(uncapped.delay_for_attempt(u32::MAX), Duration::MAX);
        assert_eq!(
            uncapped.delay_for_attempt(1),
            Duration::from_secs(u64::MAX / 4)
        );
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut b = backoff();
        for _ in 0..6 {
            b.on_failure();
        }
        assert_eq!(b.attempt(), 6);

        b.reset();
        assert_eq!(
            b.on_failure(),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn limited_attempts_are_exhausted() {
        let mut b = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            MaxAttempts::Limited(2),
        );
        assert!(matches!(b.on_failure(), RetryDecision::Retry { attempt: 1, .. }));
        assert!(matches!(b.on_failure(), RetryDecision::Retry { attempt: 2, .. }));
        assert_eq!(b.on_failure(), RetryDecision::Exhausted { attempts: 2 });
    }

    #[test]
    fn negative_max_means_unbounded() {
        assert_eq!(MaxAttempts::from_signed(-1), MaxAttempts::Unbounded);
        assert_eq!(MaxAttempts::from_signed(5), MaxAttempts::Limited(5));
    }

    #[test]
    fn jitter_delay_respects_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let delay = jitter_delay(base);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= base);
        }
        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
    }
}
