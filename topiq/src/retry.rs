//! Retry policies for connection-class failures.
//!
//! A [`RetryPolicy`] answers one question: after `n` failed attempts, how long
//! should the caller wait before the next one, if at all. Connecting retries
//! forever with a fixed delay plus random jitter; publishing retries a few
//! times with no delay.

use std::time::Duration;

use rand::Rng;

/// Random extra delay added on top of a policy's fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    None,
    /// Uniform in `[min, max]`
    Range { min: Duration, max: Duration },
}

impl Jitter {
    pub fn range(min: Duration, max: Duration) -> Self {
        Jitter::Range { min, max }
    }

    /// Draw one jitter value.
    pub fn sample(&self) -> Duration {
        match *self {
            Jitter::None => Duration::ZERO,
            Jitter::Range { min, max } => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                if min_ms >= max_ms {
                    return min;
                }
                Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
            }
        }
    }

    /// Largest value [`Jitter::sample`] can return.
    pub fn upper_bound(&self) -> Duration {
        match *self {
            Jitter::None => Duration::ZERO,
            Jitter::Range { min, max } => min.max(max),
        }
    }
}

/// When and how often to retry a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Fixed wait between attempts
    pub delay: Duration,
    pub jitter: Jitter,
}

impl RetryPolicy {
    /// Retry without limit.
    pub fn forever(delay: Duration, jitter: Jitter) -> Self {
        Self {
            max_attempts: None,
            delay,
            jitter,
        }
    }

    /// At most `attempts` tries in total.
    pub fn bounded(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(attempts),
            delay,
            jitter: Jitter::None,
        }
    }

    /// Fail on the first error.
    pub fn never() -> Self {
        Self::bounded(1, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before the next attempt, given how many attempts already failed.
    /// `None` means the attempts are exhausted.
    pub fn delay_for(&self, failed_attempts: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if failed_attempts >= max {
                return None;
            }
        }
        Some(self.delay + self.jitter.sample())
    }

    /// Sleep before the next attempt. Returns `false` when the attempts are
    /// exhausted, without sleeping.
    pub async fn pause(&self, failed_attempts: u32) -> bool {
        match self.delay_for(failed_attempts) {
            Some(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                true
            }
            None => false,
        }
    }
}

impl Default for RetryPolicy {
    /// Connection policy: forever, 5 s plus 1-3 s of jitter.
    fn default() -> Self {
        Self::forever(
            Duration::from_secs(5),
            Jitter::range(Duration::from_secs(1), Duration::from_secs(3)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_jitter_stays_in_range() {
        let jitter = Jitter::range(Duration::from_millis(100), Duration::from_millis(300));
        for _ in 0..200 {
            let sample = jitter.sample();
            assert!(sample >= Duration::from_millis(100));
            assert!(sample <= Duration::from_millis(300));
        }
        assert_eq!(Jitter::None.sample(), Duration::ZERO);
        assert_eq!(jitter.upper_bound(), Duration::from_millis(300));
    }

    #[test]
    fn test_degenerate_jitter_range() {
        let jitter = Jitter::range(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(jitter.sample(), Duration::from_secs(2));
    }

    #[rstest]
    #[case(0, true)]
    #[case(4, true)]
    #[case(5, false)]
    #[case(9, false)]
    fn test_bounded_policy(#[case] failed: u32, #[case] retries: bool) {
        let policy = RetryPolicy::bounded(5, Duration::ZERO);
        assert_eq!(policy.delay_for(failed).is_some(), retries);
        if retries {
            assert_eq!(policy.delay_for(failed), Some(Duration::ZERO));
        }
    }

    #[test]
    fn test_forever_policy_never_gives_up() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(u32::MAX).unwrap();
        assert!(delay >= Duration::from_secs(6));
        assert!(delay <= Duration::from_secs(8));
        assert!(RetryPolicy::never().delay_for(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_sleeps_for_delay() {
        let policy = RetryPolicy::bounded(2, Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        assert!(policy.pause(1).await);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(!policy.pause(2).await);
    }
}
