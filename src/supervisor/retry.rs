//! Backoff and cooldown after consecutive failures

use std::time::Duration;

/// What to do after the n-th consecutive failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then retry; wakes early on stop or a new configuration
    Backoff(Duration),
    /// Retries exhausted; sleep and only reset on a new configuration
    Cooldown(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
            cooldown: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn decide(&self, failures: u32) -> RetryDecision {
        let n = failures.max(1);
        if n > self.max_retries {
            return RetryDecision::Cooldown(self.cooldown);
        }
        if n == self.max_retries {
            return RetryDecision::Backoff(self.max_delay);
        }

        let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
        RetryDecision::Backoff(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Consecutive failure bookkeeping of one supervisor
#[derive(Debug, Clone, Default)]
pub struct FailureState {
    consecutive: u32,
    cooling_down: bool,
}

impl FailureState {
    /// Count one more failure, returning the new total
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive
    }

    /// Clear the counter, returning how many failures were forgiven
    pub fn reset(&mut self) -> u32 {
        self.cooling_down = false;
        std::mem::take(&mut self.consecutive)
    }

    pub fn count(&self) -> u32 {
        self.consecutive
    }

    pub fn set_cooling_down(&mut self, cooling_down: bool) {
        self.cooling_down = cooling_down;
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooling_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<RetryDecision> = (1..=6).map(|n| policy.decide(n)).collect();
        assert_eq!(
            delays,
            vec![
                RetryDecision::Backoff(Duration::from_millis(200)),
                RetryDecision::Backoff(Duration::from_millis(400)),
                RetryDecision::Backoff(Duration::from_millis(800)),
                RetryDecision::Backoff(Duration::from_millis(1600)),
                RetryDecision::Backoff(Duration::from_secs(10)),
                RetryDecision::Cooldown(Duration::from_secs(10)),
            ]
        );
        assert_eq!(policy.decide(60), RetryDecision::Cooldown(Duration::from_secs(10)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            max_retries: 40,
            cooldown: Duration::from_secs(60),
        };
        assert_eq!(policy.decide(3), RetryDecision::Backoff(Duration::from_secs(3)));
        assert_eq!(policy.decide(39), RetryDecision::Backoff(Duration::from_secs(3)));
        assert_eq!(policy.decide(0), RetryDecision::Backoff(Duration::from_secs(1)));
    }

    #[test]
    fn test_failure_state() {
        let mut state = FailureState::default();
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        state.set_cooling_down(true);

        assert_eq!(state.reset(), 2);
        assert_eq!(state.count(), 0);
        assert!(!state.is_cooling_down());
    }
}
