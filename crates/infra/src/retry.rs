//! Backoff policies for message redelivery and startup connection attempts.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tracing::warn;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base`, `2 * base`, `4 * base`, ... up to the ceiling.
    #[default]
    Exponential,
}

/// Redelivery and reconnect schedule.
///
/// `max_delay` is the ceiling for every computed delay. For redelivery it is
/// clamped to the consumer's ack-wait (see
/// [`PipelineConfig::redelivery_policy`](crate::PipelineConfig::redelivery_policy)),
/// so a nak never asks the log to hold a message longer than it would hold an
/// abandoned one.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed in total; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction (0.0-1.0) by which a redelivery may be pulled earlier.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(None, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: Option<u32>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }

    /// Lower the ceiling to `limit` (the base delay is lowered with it).
    pub fn capped_at(mut self, limit: Duration) -> Self {
        self.max_delay = self.max_delay.min(limit);
        self.base_delay = self.base_delay.min(self.max_delay);
        self
    }

    /// Delay after failed attempt number `attempt` (1-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Nak delay for a message that failed on its `delivery_count`-th delivery.
    ///
    /// Jitter is derived from the message id, so messages that fail together
    /// (a generator outage) come back spread out, while one message always
    /// gets the same delay for the same delivery count. It only shortens the
    /// delay, never past `(1 - jitter)` of it.
    pub fn redelivery_delay(&self, delivery_count: u32, message_id: &str) -> Duration {
        let delay = self.delay_for_attempt(delivery_count);
        let jitter_permille = (self.jitter.clamp(0.0, 1.0) * 1_000.0) as u128;
        if jitter_permille == 0 || delay.is_zero() {
            return delay;
        }
        let mut hasher = DefaultHasher::new();
        message_id.hash(&mut hasher);
        delivery_count.hash(&mut hasher);
        let unit_permille = u128::from(hasher.finish() % 1_000);

        let nanos = delay.as_nanos();
        let earlier = nanos * jitter_permille * unit_permille / 1_000_000;
        Duration::from_nanos(u64::try_from(nanos - earlier).unwrap_or(u64::MAX))
    }

    /// True when another attempt may follow attempt number `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Run `operation` until it succeeds or the policy gives up.
///
/// Returns the last error when attempts are exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn redelivery() -> RetryPolicy {
        RetryPolicy::exponential(None, Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn redelivery_schedule_doubles_up_to_ceiling() {
        let policy = redelivery();
        let secs: Vec<u64> = (1..=8).map(|n| policy.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn ack_wait_caps_every_delay() {
        let policy = redelivery().capped_at(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert!(policy.redelivery_delay(10, "1-0") <= Duration::from_secs(5));

        let tiny = redelivery().capped_at(Duration::from_millis(300));
        assert_eq!(tiny.delay_for_attempt(1), Duration::from_millis(300));
    }

    #[test]
    fn fixed_delay_ignores_delivery_count() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(policy.redelivery_delay(1, "a"), Duration::from_millis(500));
        assert_eq!(policy.redelivery_delay(3, "b"), Duration::from_millis(500));
    }

    #[test]
    fn simultaneous_failures_are_spread_out() {
        let policy = redelivery();
        let delays: std::collections::HashSet<Duration> = (0..20)
            .map(|n| policy.redelivery_delay(3, &format!("1700000000000-{}", n)))
            .collect();
        assert!(delays.len() > 1);
        assert_eq!(policy.redelivery_delay(3, "1-0"), policy.redelivery_delay(3, "1-0"));
    }

    #[test]
    fn unbounded_policy_always_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(u32::MAX - 1));

        let bounded = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(bounded.should_retry(2));
        assert!(!bounded.should_retry(3));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<u32, String> = retry_with_backoff(&policy, "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(format!("fail {}", n)) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let result: Result<(), String> = retry_with_backoff(&policy, "down", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("fail {}", n)) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "fail 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn jitter_only_pulls_redelivery_earlier(
            count in 1u32..10_000,
            id in "[0-9]{1,13}-[0-9]{1,3}",
            base in 1u64..5_000,
            cap in 1u64..120_000,
        ) {
            let policy = RetryPolicy::exponential(None, Duration::from_millis(base), Duration::from_millis(cap));
            let full = policy.delay_for_attempt(count);
            let jittered = policy.redelivery_delay(count, &id);
            prop_assert!(jittered <= full);
            prop_assert!(jittered >= full.mul_f64(0.79));
            prop_assert!(full <= policy.max_delay);
        }
    }
}
