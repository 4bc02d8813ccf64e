//! Retry and backoff policy.
//!
//! `attempt` is always the number of deliveries made so far, so the first
//! retry of a job asks for `next(1)` and waits `base * 2`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::Job;

fn default_base() -> Duration {
    Duration::from_secs(1)
}

fn default_cap() -> Duration {
    Duration::from_secs(300)
}

/// Exponential backoff: `min(base * 2^attempt, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base", with = "humantime_serde")]
    pub base: Duration,
    #[serde(default = "default_cap", with = "humantime_serde")]
    pub cap: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5)`
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: default_base(),
            cap: default_cap(),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next delivery
    pub fn next(&self, attempt: u32) -> Duration {
        self.next_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn next_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.exponential(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let factor: f64 = rng.gen_range(0.5..1.5);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.cap)
    }
}

/// What the consumer loop does with a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue(Duration),
    DeadLetter,
}

/// Decide the fate of a failed delivery of `job`.
///
/// `requested` is a delay asked for by the handler; it wins over the job's
/// `retry_delay`, which wins over the pipeline policy.
pub fn decide(job: &Job, requested: Option<Duration>, policy: &BackoffPolicy) -> RetryDecision {
    let deliveries = job.attempt.saturating_add(1);
    if deliveries >= job.options.max_attempts {
        return RetryDecision::DeadLetter;
    }

    let delay = requested
        .or_else(|| job.options.retry_delay.map(|d| d.delay_for(deliveries)))
        .unwrap_or_else(|| policy.next(deliveries));

    RetryDecision::Requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobOptions, RetryDelay};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn job(attempt: u32, max_attempts: u32) -> Job {
        let mut job = Job::new(
            "emails",
            "hello",
            JobOptions {
                max_attempts,
                ..JobOptions::default()
            },
        );
        job.attempt = attempt;
        job
    }

    #[test]
    fn doubles_from_base_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(policy.next(0), Duration::from_secs(1));
        assert_eq!(policy.next(1), Duration::from_secs(2));
        assert_eq!(policy.next(3), Duration::from_secs(8));
        assert_eq!(policy.next(4), Duration::from_secs(10));
        assert_eq!(policy.next(200), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy =
            BackoffPolicy::new(Duration::from_secs(4), Duration::from_secs(60)).with_jitter(true);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let delay = policy.next_with_rng(1, &mut rng);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay < Duration::from_secs(12));
        }
    }

    #[test]
    fn requeues_until_attempts_are_spent() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_secs(1));

        assert_eq!(
            decide(&job(0, 3), None, &policy),
            RetryDecision::Requeue(Duration::from_millis(20))
        );
        assert_eq!(
            decide(&job(1, 3), None, &policy),
            RetryDecision::Requeue(Duration::from_millis(40))
        );
        assert_eq!(decide(&job(2, 3), None, &policy), RetryDecision::DeadLetter);
        assert_eq!(decide(&job(0, 1), None, &policy), RetryDecision::DeadLetter);
    }

    #[test]
    fn handler_delay_overrides_job_delay() {
        let policy = BackoffPolicy::default();
        let mut retried = job(0, 5);
        retried.options.retry_delay = Some(RetryDelay::Fixed(Duration::from_secs(9)));

        assert_eq!(
            decide(&retried, None, &policy),
            RetryDecision::Requeue(Duration::from_secs(9))
        );
        assert_eq!(
            decide(&retried, Some(Duration::from_secs(1)), &policy),
            RetryDecision::Requeue(Duration::from_secs(1))
        );
    }

    proptest! {
        #[test]
        fn backoff_is_monotone_up_to_cap(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..10_000_000,
            attempt in 0u32..64,
        ) {
            let policy =
                BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
            let current = policy.next(attempt);
            let following = policy.next(attempt + 1);

            prop_assert!(current <= following);
            prop_assert!(following <= policy.cap);
        }
    }
}
