use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{JobId, JobOptions, ReservationToken};
use crate::JobError;

/// A unit of work submitted by a producer.
///
/// The payload is opaque to the engine. `attempt` counts earlier
/// deliveries: it is 0 on the first delivery and grows by one with every
/// reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub pipeline: String,
    pub payload: Bytes,
    pub options: JobOptions,
    pub attempt: u32,
}

impl Job {
    /// Create a fresh job with a new id and no deliveries
    pub fn new(
        pipeline: impl Into<String>,
        payload: impl Into<Bytes>,
        options: JobOptions,
    ) -> Self {
        Self {
            id: JobId::new(),
            pipeline: pipeline.into(),
            payload: payload.into(),
            options,
            attempt: 0,
        }
    }

    /// Decode a JSON payload. Undecodable payloads will never succeed, so
    /// they map to a permanent error.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| JobError::permanent(format!("undecodable payload: {e}")))
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Whether this delivery is the last one the attempt budget allows
    pub fn is_last_attempt(&self) -> bool {
        self.attempt.saturating_add(1) >= self.options.max_attempts
    }
}

/// A job handed to exactly one consumer until acked, nacked or the
/// visibility timeout elapses
#[derive(Debug, Clone)]
pub struct Reservation {
    pub job: Job,
    pub token: ReservationToken,
    pub reserved_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(job: Job, token: ReservationToken) -> Self {
        Self {
            job,
            token,
            reserved_at: Utc::now(),
        }
    }
}

/// Best-effort pipeline counters reported by a broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStat {
    /// Visible and waiting for a consumer
    pub queued: u64,
    /// Handed to a consumer and not yet resolved
    pub reserved: u64,
    /// Not yet visible because of a push delay or retry delay
    pub delayed: u64,
}

impl PipelineStat {
    pub fn total(&self) -> u64 {
        self.queued + self.reserved + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, PartialEq, Debug)]
    struct Email {
        to: String,
    }

    #[test]
    fn decodes_json_payloads() {
        let job = Job::new("emails", r#"{"to":"ops@example.com"}"#, JobOptions::default());
        let email: Email = job.json().unwrap();
        assert_eq!(email.to, "ops@example.com");
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn undecodable_payload_is_permanent() {
        let job = Job::new("emails", "not json", JobOptions::default());
        let err = job.json::<Email>().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn last_attempt_follows_budget() {
        let mut job = Job::new(
            "emails",
            "hello",
            JobOptions {
                max_attempts: 2,
                ..JobOptions::default()
            },
        );
        assert!(!job.is_last_attempt());
        job.attempt = 1;
        assert!(job.is_last_attempt());
    }
}
