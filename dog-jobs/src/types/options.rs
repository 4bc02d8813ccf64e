use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::BackoffPolicy;
use crate::{JobsError, JobsResult};

/// Per-job override of the delay before a failed job is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDelay {
    /// Same delay for every retry
    Fixed(#[serde(with = "humantime_serde")] Duration),
    /// Exponential delay computed from the delivery count
    Backoff(BackoffPolicy),
}

impl RetryDelay {
    /// Delay for a retry after `deliveries` deliveries
    pub fn delay_for(&self, deliveries: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Backoff(policy) => policy.next(deliveries),
        }
    }
}

/// Resolved options carried by every job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Time before the job first becomes visible to consumers
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,

    /// Total deliveries allowed before the job is dead-lettered (at least 1)
    pub max_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<RetryDelay>,

    /// Handler deadline; the pipeline timeout applies when unset
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: 1,
            retry_delay: None,
            timeout: None,
        }
    }
}

/// Producer-supplied options. Unset fields fall back to the pipeline or
/// dispatch rule defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOptions {
    #[serde(default, with = "humantime_serde")]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<RetryDelay>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl PushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fill unset fields from `defaults`. Fields set on `self` win.
    pub fn or(self, defaults: &PushOptions) -> Self {
        Self {
            delay: self.delay.or(defaults.delay),
            max_attempts: self.max_attempts.or(defaults.max_attempts),
            retry_delay: self.retry_delay.or(defaults.retry_delay),
            timeout: self.timeout.or(defaults.timeout),
        }
    }

    /// Resolve against the pipeline's default attempt budget
    pub fn resolve(self, default_max_attempts: u32) -> JobsResult<JobOptions> {
        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(JobsError::InvalidPayload(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(JobOptions {
            delay: self.delay.unwrap_or_default(),
            max_attempts,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_uses_pipeline_default_attempts() {
        let options = PushOptions::new().resolve(3).unwrap();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.delay, Duration::ZERO);

        let options = PushOptions::new().max_attempts(5).resolve(3).unwrap();
        assert_eq!(options.max_attempts, 5);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = PushOptions::new().max_attempts(0).resolve(3).unwrap_err();
        assert!(matches!(err, JobsError::InvalidPayload(_)));
    }

    #[test]
    fn producer_options_win_over_defaults() {
        let defaults = PushOptions::new()
            .max_attempts(5)
            .delay(Duration::from_secs(1));
        let merged = PushOptions::new().max_attempts(2).or(&defaults);

        assert_eq!(merged.max_attempts, Some(2));
        assert_eq!(merged.delay, Some(Duration::from_secs(1)));
    }

    #[test]
    fn options_parse_humantime() {
        let options: PushOptions = serde_json::from_str(
            r#"{"delay": "250ms", "max_attempts": 4, "retry_delay": {"fixed": "2s"}}"#,
        )
        .unwrap();

        assert_eq!(options.delay, Some(Duration::from_millis(250)));
        assert_eq!(options.retry_delay, Some(RetryDelay::Fixed(Duration::from_secs(2))));
        assert_eq!(
            RetryDelay::Fixed(Duration::from_secs(2)).delay_for(7),
            Duration::from_secs(2)
        );
    }
}
