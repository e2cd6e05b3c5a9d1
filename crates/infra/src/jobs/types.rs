//! Retry policy and queue message types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use podforge_core::JobId;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
///
/// Backoff is exponential, `min(base * 2^retry_index, cap)`, with jitter that
/// only ever shortens a delay. Delays handed out for one job never decrease
/// and never exceed the cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0): the largest fraction shaved off a delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff and no jitter.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    /// Un-jittered delay before retry number `retry_index` (0-based).
    pub fn base_delay_for(&self, retry_index: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_index).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry_index`, given the delay used before the
    /// previous retry of the same job.
    pub fn delay_for(&self, retry_index: u32, previous: Option<Duration>) -> Duration {
        let delay = self.base_delay_for(retry_index);
        let jittered = if self.jitter > 0.0 {
            let shave: f64 = rand::rng().random_range(0.0..=self.jitter);
            delay.mul_f64(1.0 - shave)
        } else {
            delay
        };
        let floor = previous.unwrap_or(Duration::ZERO).min(self.max_delay);
        jittered.max(floor).min(self.max_delay)
    }

    /// Whether the job may run again after attempt `failed_attempt` (0-based)
    /// failed. With `max_retries = N` a job runs at most N+1 times.
    pub fn should_retry(&self, failed_attempt: u32) -> bool {
        failed_attempt < self.max_retries
    }
}

/// What travels on the job queue: which job, which attempt, and when it may
/// start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: JobId,
    /// 0-based attempt number this delivery is for.
    pub attempt: u32,
    pub not_before: DateTime<Utc>,
    /// Backoff used before this attempt; 0 for the first one.
    #[serde(default)]
    pub last_delay_ms: u64,
}

impl QueueMessage {
    /// First attempt of a freshly created job.
    pub fn first(job_id: JobId) -> Self {
        Self {
            job_id,
            attempt: 0,
            not_before: Utc::now(),
            last_delay_ms: 0,
        }
    }

    /// Message for the attempt after this one, runnable after `delay`.
    pub fn next_attempt(&self, delay: Duration) -> Self {
        Self {
            job_id: self.job_id,
            attempt: self.attempt + 1,
            not_before: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
            last_delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Backoff used before this attempt, if it is a retry.
    pub fn last_delay(&self) -> Option<Duration> {
        (self.attempt > 0).then(|| Duration::from_millis(self.last_delay_ms))
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }
}

/// A message handed to a worker, with the queue's receipt for acking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: QueueMessage,
    pub receipt: String,
    /// How many times the queue has handed out this message.
    pub delivery_count: u32,
}

/// Entry in the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: QueueMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(message: QueueMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(policy.base_delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.base_delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.base_delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.base_delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.base_delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn retry_ceiling_allows_n_plus_one_attempts() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(8));
        let attempts = (0..).take_while(|&a| a == 0 || policy.should_retry(a - 1)).count();
        assert_eq!(attempts, 4);
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn jitter_only_shortens_the_first_delay() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(0, None);
            assert!(d <= Duration::from_secs(5));
            assert!(d >= Duration::from_millis(3750));
        }
    }

    #[test]
    fn message_chain_carries_attempt_and_delay() {
        let first = QueueMessage::first(JobId::new());
        assert_eq!(first.last_delay(), None);

        let second = first.next_attempt(Duration::from_millis(4200));
        assert_eq!(second.attempt, 1);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.last_delay(), Some(Duration::from_millis(4200)));
        assert!(!second.is_ready(Utc::now()));
    }

    proptest! {
        #[test]
        fn delays_never_decrease_and_stay_capped(
            max_retries in 1u32..12,
            base_ms in 1u64..5_000,
            cap_ms in 1u64..120_000,
            jitter in 0.0f64..=1.0,
        ) {
            let policy = RetryPolicy::exponential(
                max_retries,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            )
            .with_jitter(jitter);

            let mut previous = None;
            for retry in 0..max_retries {
                let delay = policy.delay_for(retry, previous);
                prop_assert!(delay <= policy.max_delay);
                if let Some(prev) = previous {
                    prop_assert!(delay >= prev);
                }
                previous = Some(delay);
            }
        }
    }
}
