//! Reconnection backoff policy shared by downstream services and upstream
//! endpoint sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with jitter.
///
/// `max_attempts = None` retries forever, which is how upstream endpoint
/// sessions run; downstream services default to a bounded count and then
/// hold in a failed state until explicitly restarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde::option", default)]
    pub initial: Option<Duration>,

    pub multiplier: f64,

    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub cap: Duration,

    pub max_attempts: Option<u32>,

    /// Fraction of random inflation applied to each delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Some(Duration::from_secs(1)),
            multiplier: 1.5,
            cap: Duration::from_secs(30),
            max_attempts: Some(5),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Policy for upstream endpoint sessions: same curve, never gives up
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 is an
    /// immediate retry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let initial = self.initial.unwrap_or(Duration::from_secs(1));
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = initial.as_secs_f64() * factor;
        let capped = raw.min(self.cap.as_secs_f64());

        if self.jitter > 0.0 {
            let inflation = 1.0 + rand::random::<f64>() * self.jitter;
            Duration::from_secs_f64((capped * inflation).min(self.cap.as_secs_f64() * 2.0))
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Whether `attempt` (1-based) exceeds the configured budget
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt > max,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_curve() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2250));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_never_shrinks_delay() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=6 {
            let base = no_jitter().delay_for(attempt);
            let jittered = policy.delay_for(attempt);
            assert!(jittered >= base, "attempt {}: {:?} < {:?}", attempt, jittered, base);
        }
    }

    #[test]
    fn test_exhaustion() {
        let policy = BackoffPolicy::default();
        assert!(!policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
        assert!(!BackoffPolicy::unbounded().is_exhausted(1_000));
    }
}
