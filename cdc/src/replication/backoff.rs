use std::time::Duration;

use cdc_config::shared::RetryConfig;

/// Exponential backoff between failed replication passes of one table.
///
/// The n-th consecutive failure waits `initial * factor^(n - 1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
            attempt: 0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.initial_delay(), config.backoff_factor, config.max_delay())
    }

    /// Records one more failure and returns how long to wait before the next pass.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for_attempt(self.attempt)
    }

    /// Forgets previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial.min(self.max);
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial.as_secs_f64() * self.factor.powi(exponent);

        Duration::try_from_secs_f64(delay_secs)
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(10), 2.0, Duration::from_secs(300))
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let mut backoff = backoff();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();

        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = backoff();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn huge_attempts_saturate_at_the_cap() {
        assert_eq!(backoff().delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }
}
