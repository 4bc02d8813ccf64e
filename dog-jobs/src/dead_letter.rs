//! Terminal destination for jobs that will not be retried.
//!
//! Entries are kept in a bounded in-memory queue (oldest evicted first)
//! and can additionally be forwarded to a dead-letter pipeline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::types::Job;

/// Why a job was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The handler declared the job unprocessable
    Rejected { reason: String },
    /// The attempt budget ran out; `last_error` describes the final failure
    AttemptsExceeded { attempts: u32, last_error: String },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { reason } => write!(f, "rejected: {reason}"),
            Self::AttemptsExceeded { attempts, last_error } => {
                write!(f, "gave up after {attempts} attempts: {last_error}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: DeadLetterReason,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(job: Job, reason: DeadLetterReason) -> Self {
        Self {
            job,
            reason,
            failed_at: Utc::now(),
        }
    }
}

pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    total: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, entry: DeadLetter) {
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                warn!(
                    "Dead-letter queue full, evicting job {} of {}",
                    evicted.job.id, evicted.job.pipeline
                );
            }
        }
        entries.push_back(entry);
    }

    /// Entries of one pipeline, oldest first
    pub fn list(&self, pipeline: &str) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.job.pipeline == pipeline)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Remove and return the entries of one pipeline
    pub fn drain(&self, pipeline: &str) -> Vec<DeadLetter> {
        let mut entries = self.entries.lock();
        let (drained, kept): (VecDeque<_>, VecDeque<_>) = entries
            .drain(..)
            .partition(|entry| entry.job.pipeline == pipeline);
        *entries = kept;
        drained.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs dead-lettered since start, including evicted ones
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}
