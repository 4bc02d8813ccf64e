//! Configuration of the jobs section.
//!
//! ```json
//! {
//!   "grace_period": "30s",
//!   "consume": ["emails"],
//!   "pipelines": {
//!     "emails": {
//!       "broker": "local",
//!       "concurrency": 4,
//!       "max_attempts": 3,
//!       "retry": { "base": "1s", "cap": "5m" }
//!     }
//!   },
//!   "dispatch": { "mail.*": { "pipeline": "emails" } }
//! }
//! ```
//!
//! Durations are humantime strings. Connection sections are specific to
//! the broker kind and parsed when the pipeline is registered.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::BackoffPolicy;
use crate::types::PushOptions;
use crate::{JobsError, JobsResult};

fn default_concurrency() -> usize {
    1
}

fn default_prefetch() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(10)
}

fn default_reserve_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_dead_letter_capacity() -> usize {
    1000
}

/// How a pipeline's jobs are consumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeConfig {
    /// Maximum simultaneous reservations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Batch size for brokers that receive in batches
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Attempt budget for jobs pushed without one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Handler deadline for jobs pushed without one
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub retry: BackoffPolicy,

    /// Reservation extension interval while a handler runs
    #[serde(default = "default_heartbeat", with = "humantime_serde")]
    pub heartbeat: Duration,

    /// How long one reserve call waits before the loop re-checks state
    #[serde(default = "default_reserve_timeout", with = "humantime_serde")]
    pub reserve_timeout: Duration,

    /// Overrides the service-wide grace period
    #[serde(default, with = "humantime_serde")]
    pub grace_period: Option<Duration>,

    /// Pipeline that also receives dead-lettered jobs
    #[serde(default)]
    pub dead_letter: Option<String>,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            prefetch: default_prefetch(),
            max_attempts: default_max_attempts(),
            timeout: None,
            retry: BackoffPolicy::default(),
            heartbeat: default_heartbeat(),
            reserve_timeout: default_reserve_timeout(),
            grace_period: None,
            dead_letter: None,
        }
    }
}

impl ConsumeConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    pub fn with_dead_letter(mut self, pipeline: impl Into<String>) -> Self {
        self.dead_letter = Some(pipeline.into());
        self
    }

    pub fn validate(&self, pipeline: &str) -> JobsResult<()> {
        let invalid = |what: &str| {
            Err(JobsError::Configuration(format!(
                "pipeline {pipeline}: {what}"
            )))
        };

        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.prefetch == 0 {
            return invalid("prefetch must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.heartbeat.is_zero() {
            return invalid("heartbeat must be positive");
        }
        if self.retry.base > self.retry.cap {
            return invalid("retry base exceeds retry cap");
        }
        if self.dead_letter.as_deref() == Some(pipeline) {
            return invalid("dead_letter cannot point at the pipeline itself");
        }
        Ok(())
    }
}

/// One pipeline: broker binding plus consume settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Broker kind, e.g. `local`, `reservation-protocol`, `cloud-queue`
    pub broker: String,

    /// Broker-specific connection section
    #[serde(default)]
    pub connection: Value,

    #[serde(flatten)]
    pub consume: ConsumeConfig,
}

impl PipelineConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            connection: Value::Null,
            consume: ConsumeConfig::default(),
        }
    }

    pub fn with_connection(mut self, connection: Value) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_consume(mut self, consume: ConsumeConfig) -> Self {
        self.consume = consume;
        self
    }
}

/// Routes a job name to a pipeline, with default options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRule {
    pub pipeline: String,
    #[serde(flatten)]
    pub options: PushOptions,
}

impl DispatchRule {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            options: PushOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PushOptions) -> Self {
        self.options = options;
        self
    }
}

/// The whole jobs section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineConfig>,

    /// Job-name patterns (exact, or prefix ending in `*`) to routing rules
    #[serde(default)]
    pub dispatch: BTreeMap<String, DispatchRule>,

    /// Pipelines consumed by this process
    #[serde(default)]
    pub consume: Vec<String>,

    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Entries kept by the in-memory dead-letter queue
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            pipelines: BTreeMap::new(),
            dispatch: BTreeMap::new(),
            consume: Vec::new(),
            grace_period: default_grace_period(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl JobsConfig {
    pub fn from_value(value: Value) -> JobsResult<Self> {
        let value = if value.is_null() {
            Value::Object(Default::default())
        } else {
            value
        };
        serde_json::from_value(value)
            .map_err(|e| JobsError::Configuration(format!("invalid jobs config: {e}")))
    }

    pub fn from_json_str(raw: &str) -> JobsResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| JobsError::Configuration(format!("invalid jobs config: {e}")))
    }

    pub fn with_pipeline(mut self, name: impl Into<String>, pipeline: PipelineConfig) -> Self {
        self.pipelines.insert(name.into(), pipeline);
        self
    }

    pub fn with_consume(mut self, pipeline: impl Into<String>) -> Self {
        self.consume.push(pipeline.into());
        self
    }

    pub fn with_dispatch(mut self, pattern: impl Into<String>, rule: DispatchRule) -> Self {
        self.dispatch.insert(pattern.into(), rule);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Cross-reference checks; broker kinds are checked at registration
    pub fn validate(&self) -> JobsResult<()> {
        for (name, pipeline) in &self.pipelines {
            pipeline.consume.validate(name)?;
            if let Some(target) = &pipeline.consume.dead_letter {
                self.require_pipeline(target, &format!("dead_letter of {name}"))?;
            }
        }

        for name in &self.consume {
            self.require_pipeline(name, "consume")?;
        }

        for (pattern, rule) in &self.dispatch {
            self.require_pipeline(&rule.pipeline, &format!("dispatch rule {pattern}"))?;
        }

        Ok(())
    }

    fn require_pipeline(&self, name: &str, referenced_by: &str) -> JobsResult<()> {
        if self.pipelines.contains_key(name) {
            Ok(())
        } else {
            Err(JobsError::Configuration(format!(
                "{referenced_by} references undefined pipeline {name}"
            )))
        }
    }
}
