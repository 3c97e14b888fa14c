use std::collections::HashMap;
use std::time::Duration;

use logrelay_types::FailureClass;

/// How the delay grows across consecutive failures of one class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Always wait the base interval
    #[default]
    Fixed,
    /// interval * multiplier^(n-1), capped at `max`
    Exponential { multiplier: u32, max: Duration },
}

/// Bounds and pacing for the gate loop
///
/// With neither `max_attempts` nor `deadline` set the gate polls until it
/// succeeds or is cancelled.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub deadline: Option<Duration>,
    backoff: HashMap<FailureClass, Backoff>,
}

impl RetryPolicy {
    /// Poll forever at a fixed interval
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            deadline: None,
            backoff: HashMap::new(),
        }
    }

    /// Give up after `max_attempts` probes
    pub fn bounded(max_attempts: u32, interval: Duration) -> Self {
        Self::fixed(interval).with_max_attempts(max_attempts)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Override the backoff used for one failure class
    pub fn with_backoff(mut self, class: FailureClass, backoff: Backoff) -> Self {
        self.backoff.insert(class, backoff);
        self
    }

    pub fn backoff_for(&self, class: FailureClass) -> Backoff {
        self.backoff.get(&class).copied().unwrap_or_default()
    }

    /// Whether another attempt is allowed after `attempts` have run
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    /// Delay before the next probe, given `streak` consecutive failures of `class`
    pub fn delay_for(&self, class: FailureClass, streak: u32) -> Duration {
        match self.backoff_for(class) {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { multiplier, max } => {
                let factor = multiplier.saturating_pow(streak.saturating_sub(1));
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_is_unbounded() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_attempt(1_000_000));
        assert_eq!(policy.delay_for(FailureClass::Connect, 50), Duration::from_secs(1));
    }

    #[test]
    fn test_bounded_attempts() {
        let policy = RetryPolicy::bounded(5, Duration::from_secs(5));
        assert!(policy.allows_attempt(4));
        assert!(!policy.allows_attempt(5));
    }

    #[test]
    fn test_exponential_backoff_per_class() {
        let policy = RetryPolicy::fixed(Duration::from_millis(100)).with_backoff(
            FailureClass::Auth,
            Backoff::Exponential {
                multiplier: 2,
                max: Duration::from_millis(500),
            },
        );

        assert_eq!(policy.delay_for(FailureClass::Auth, 1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(FailureClass::Auth, 2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(FailureClass::Auth, 3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(FailureClass::Auth, 4), Duration::from_millis(500));
        // Other classes keep the base interval
        assert_eq!(policy.delay_for(FailureClass::Connect, 4), Duration::from_millis(100));
    }
}
