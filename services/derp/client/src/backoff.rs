//! Attempt counter over [`BackoffConfig`].

use std::time::Duration;

use crate::config::BackoffConfig;

/// Tracks consecutive failures and hands out the next delay
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start at attempt zero
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.backoff_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget past failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_and_reset() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            multiplier: 2.0,
            jitter: 0.0,
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
