//! Retry policies
//!
//! A [`RetryPolicy`] decides whether a failed message gets another attempt
//! and how long the retry is deferred. Both decisions are made from the retry
//! headers carried by the message, so the policy itself holds no state.

use std::fmt;
use std::time::Duration;

use crate::models::{format_duration, Message, MAX_HEADER_DURATION};

/// `max_retries` value meaning there is no limit
pub const UNLIMITED_RETRIES: i32 = -1;

pub trait RetryPolicy: fmt::Display + Send + Sync {
    /// True if a message that just failed should be retried
    fn should_retry(&self, message: &Message) -> bool;

    /// How long to defer the retry copy of a message
    fn retry_delay(&self, message: &Message) -> Duration;
}

fn within_limit(max_retries: i32, message: &Message) -> bool {
    if max_retries == UNLIMITED_RETRIES {
        return true;
    }
    let (_, _, num) = message.retry_attempt();
    u64::try_from(max_retries).map_or(false, |max| num <= max)
}

fn describe_limit(f: &mut fmt::Formatter<'_>, max_retries: i32) -> fmt::Result {
    match max_retries {
        UNLIMITED_RETRIES => write!(f, "(unlimited retries)"),
        1 => write!(f, "(max 1 retry)"),
        n => write!(f, "(max {} retries)", n),
    }
}

/// Retry after the same delay every time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearRetryPolicy {
    pub wait: Duration,
    pub max_retries: i32,
}

impl LinearRetryPolicy {
    pub fn new(wait: Duration, max_retries: i32) -> Self {
        Self { wait, max_retries }
    }
}

impl RetryPolicy for LinearRetryPolicy {
    fn should_retry(&self, message: &Message) -> bool {
        within_limit(self.max_retries, message)
    }

    fn retry_delay(&self, _message: &Message) -> Duration {
        self.wait
    }
}

impl fmt::Display for LinearRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Linear: Wait {} ", format_duration(self.wait))?;
        describe_limit(f, self.max_retries)
    }
}

/// Double the delay on every retry, up to `max_wait`
///
/// A zero `max_wait` bounds the delay only by the longest deferral a header
/// can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoffRetryPolicy {
    pub initial_wait: Duration,
    pub max_wait: Duration,
    pub max_retries: i32,
}

impl ExponentialBackoffRetryPolicy {
    pub fn new(initial_wait: Duration, max_wait: Duration, max_retries: i32) -> Self {
        Self {
            initial_wait,
            max_wait,
            max_retries,
        }
    }
}

impl RetryPolicy for ExponentialBackoffRetryPolicy {
    fn should_retry(&self, message: &Message) -> bool {
        within_limit(self.max_retries, message)
    }

    fn retry_delay(&self, message: &Message) -> Duration {
        let (_, _, num) = message.retry_attempt();
        let ceiling = if self.max_wait.is_zero() {
            MAX_HEADER_DURATION
        } else {
            self.max_wait.min(MAX_HEADER_DURATION)
        };

        // Any non-zero wait reaches the ceiling within 64 doublings.
        let mut delay = self.initial_wait.min(ceiling);
        for _ in 1..num.min(65) {
            if delay.is_zero() || delay >= ceiling {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(ceiling)
    }
}

impl fmt::Display for ExponentialBackoffRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max_wait.is_zero() {
            write!(f, "ExponentialBackoff: Wait {}+ ", format_duration(self.initial_wait))?;
        } else {
            write!(
                f,
                "ExponentialBackoff: Wait {}-{} ",
                format_duration(self.initial_wait),
                format_duration(self.max_wait)
            )?;
        }
        describe_limit(f, self.max_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(num: u64) -> Message {
        let mut msg = Message::new("orders", "v");
        if num > 0 {
            msg.set_retry_headers(1, num);
        }
        msg
    }

    #[test]
    fn test_linear_policy() {
        let policy = LinearRetryPolicy::new(Duration::from_secs(1), 3);

        for num in 0..=3 {
            assert!(policy.should_retry(&retry(num)), "retry {num}");
            assert_eq!(policy.retry_delay(&retry(num)), Duration::from_secs(1));
        }
        assert!(!policy.should_retry(&retry(4)));
    }

    #[test]
    fn test_unlimited_retries() {
        let policy = LinearRetryPolicy::new(Duration::from_secs(1), UNLIMITED_RETRIES);
        assert!(policy.should_retry(&retry(10_000)));
    }

    #[test]
    fn test_negative_limit_other_than_unlimited_never_retries() {
        let policy = LinearRetryPolicy::new(Duration::from_secs(1), -2);
        assert!(!policy.should_retry(&retry(0)));
    }

    #[test]
    fn test_exponential_backoff_clamps_at_max_wait() {
        let policy = ExponentialBackoffRetryPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(4),
            5,
        );
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.retry_delay(&retry(n)).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 4, 4, 4]);
    }

    #[test]
    fn test_exponential_backoff_max_wait_between_steps() {
        let policy = ExponentialBackoffRetryPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(3),
            5,
        );
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.retry_delay(&retry(n)).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 3, 3, 3, 3]);
    }

    #[test]
    fn test_exponential_backoff_without_max_wait_is_unbounded() {
        let policy =
            ExponentialBackoffRetryPolicy::new(Duration::from_secs(1), Duration::ZERO, 10);
        assert_eq!(policy.retry_delay(&retry(5)), Duration::from_secs(16));
        assert_eq!(policy.retry_delay(&retry(200)), MAX_HEADER_DURATION);
    }

    #[test]
    fn test_exponential_backoff_huge_retry_count() {
        let policy = ExponentialBackoffRetryPolicy::new(
            Duration::from_secs(1),
            Duration::ZERO,
            UNLIMITED_RETRIES,
        );
        let mut msg = retry(2_000_000_000);

        let started = std::time::Instant::now();
        let delay = policy.retry_delay(&msg);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(delay, MAX_HEADER_DURATION);

        msg.defer_for(delay);
        let deferral = msg.deferral().expect("deferral header should parse");
        assert!(deferral >= Duration::from_secs(9_223_372_036));
        assert!(msg.should_defer());

        let zero = ExponentialBackoffRetryPolicy::new(Duration::ZERO, Duration::ZERO, 3);
        assert_eq!(zero.retry_delay(&retry(u64::MAX)), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_should_retry() {
        let policy =
            ExponentialBackoffRetryPolicy::new(Duration::from_secs(1), Duration::ZERO, 2);
        assert!(policy.should_retry(&retry(2)));
        assert!(!policy.should_retry(&retry(3)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            LinearRetryPolicy::new(Duration::from_secs(1), 3).to_string(),
            "Linear: Wait 1s (max 3 retries)"
        );
        assert_eq!(
            LinearRetryPolicy::new(Duration::from_secs(1), 1).to_string(),
            "Linear: Wait 1s (max 1 retry)"
        );
        assert_eq!(
            ExponentialBackoffRetryPolicy::new(
                Duration::from_secs(2),
                Duration::from_secs(4),
                5
            )
            .to_string(),
            "ExponentialBackoff: Wait 2s-4s (max 5 retries)"
        );
    }
}
