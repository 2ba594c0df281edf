use std::time::Duration;

/// Bounded exponential backoff: `base_delay * 2^(n-1)` before retry `n`,
/// capped at `max_delay`, for at most `max_attempts` attempts in total.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl BackoffPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> BackoffHandle {
        BackoffHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u128 << shift;
        let scaled = self.base_delay.as_millis().saturating_mul(factor);
        let raw = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        }
    }
}

pub struct BackoffHandle {
    policy: BackoffPolicy,
    attempts: usize,
}

impl BackoffHandle {
    /// Delay to wait before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
