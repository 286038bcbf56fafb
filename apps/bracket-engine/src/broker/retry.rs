//! Connect retry policy: a fixed attempt cap with a fixed delay between
//! attempts.

use std::time::Duration;

/// Bounded, fixed-delay retry.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    delay: Duration,
    max_attempts: u32,
    current_attempt: u32,
}

impl ConnectPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            delay,
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Register an attempt.
    ///
    /// Returns `false` once the cap is reached.
    pub const fn begin_attempt(&mut self) -> bool {
        if self.current_attempt >= self.max_attempts {
            return false;
        }
        self.current_attempt += 1;
        true
    }

    /// Delay before the next attempt, or `None` if none remain.
    #[must_use]
    pub const fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Attempt cap.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_attempts() {
        let mut policy = ConnectPolicy::new(3, Duration::from_millis(10));
        let mut attempts = 0;
        while policy.begin_attempt() {
            attempts += 1;
        }
        assert_eq!(attempts, 3);
        assert_eq!(policy.current_attempt(), 3);
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn delay_is_fixed() {
        let mut policy = ConnectPolicy::new(5, Duration::from_millis(250));
        assert!(policy.begin_attempt());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(250)));
        assert!(policy.begin_attempt());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn reset_restores_budget() {
        let mut policy = ConnectPolicy::new(1, Duration::ZERO);
        assert!(policy.begin_attempt());
        assert!(!policy.begin_attempt());
        policy.reset();
        assert!(policy.begin_attempt());
        assert_eq!(policy.max_attempts(), 1);
    }
}
