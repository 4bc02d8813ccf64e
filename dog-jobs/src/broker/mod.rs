//! Broker contract and the static broker table.
//!
//! A broker instance is owned by exactly one pipeline, so none of the
//! operations take a pipeline name.

pub mod cloud;
pub mod envelope;
pub mod local;
pub mod reservation;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::types::{BrokerCapabilities, Job, JobId, PipelineStat, Reservation};
use crate::{JobsError, JobsResult};

pub use cloud::{CloudQueueBroker, CloudQueueConfig};
pub use local::{LocalBroker, LocalConfig};
pub use reservation::{ReservationBroker, ReservationConfig};

/// Storage and transport primitives behind a pipeline
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a job. Safe to call from many producers at once.
    async fn push(&self, job: Job) -> JobsResult<JobId>;

    /// Wait up to `timeout` for a visible job. `Ok(None)` means nothing
    /// arrived in time.
    async fn reserve(&self, timeout: Duration) -> JobsResult<Option<Reservation>>;

    /// Permanently remove a reserved job. Acking an unknown or already
    /// acked reservation succeeds without effect.
    async fn ack(&self, reservation: &Reservation) -> JobsResult<()>;

    /// Make a reserved job visible again after `requeue_after`
    async fn nack(&self, reservation: &Reservation, requeue_after: Duration) -> JobsResult<()>;

    /// Push back the visibility deadline of a long-running reservation
    async fn extend(&self, _reservation: &Reservation, _by: Duration) -> JobsResult<()> {
        Ok(())
    }

    async fn stat(&self) -> JobsResult<PipelineStat>;

    fn capabilities(&self) -> BrokerCapabilities;

    /// Release transport resources at shutdown
    async fn close(&self) -> JobsResult<()> {
        Ok(())
    }
}

/// Broker kinds compiled into the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerKind {
    Local,
    ReservationProtocol,
    CloudQueue,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::ReservationProtocol => "reservation-protocol",
            Self::CloudQueue => "cloud-queue",
        }
    }

    pub fn parse(kind: &str) -> JobsResult<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "local" | "ephemeral" => Ok(Self::Local),
            "reservation-protocol" | "beanstalk" => Ok(Self::ReservationProtocol),
            "cloud-queue" | "sqs" => Ok(Self::CloudQueue),
            _ => Err(JobsError::UnknownBrokerKind(kind.to_string())),
        }
    }
}

impl FromStr for BrokerKind {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instantiate the broker described by a pipeline's configuration
pub async fn build(pipeline: &str, config: &PipelineConfig) -> JobsResult<Arc<dyn Broker>> {
    let kind = BrokerKind::parse(&config.broker)?;

    let broker: Arc<dyn Broker> = match kind {
        BrokerKind::Local => {
            let connection: LocalConfig = connection_config(pipeline, kind, &config.connection)?;
            Arc::new(LocalBroker::new(pipeline, connection))
        }
        BrokerKind::ReservationProtocol => {
            let connection: ReservationConfig =
                connection_config(pipeline, kind, &config.connection)?;
            Arc::new(ReservationBroker::connect(pipeline, connection).await?)
        }
        BrokerKind::CloudQueue => {
            let connection: CloudQueueConfig =
                connection_config(pipeline, kind, &config.connection)?;
            Arc::new(CloudQueueBroker::new(pipeline, connection, config.consume.prefetch)?)
        }
    };

    tracing::debug!(pipeline, broker = %kind, "broker instantiated");
    Ok(broker)
}

fn connection_config<T: DeserializeOwned>(
    pipeline: &str,
    kind: BrokerKind,
    connection: &Value,
) -> JobsResult<T> {
    let value = if connection.is_null() {
        Value::Object(Default::default())
    } else {
        connection.clone()
    };

    serde_json::from_value(value).map_err(|e| {
        JobsError::Configuration(format!(
            "pipeline {pipeline}: invalid {kind} connection: {e}"
        ))
    })
}

/// Whole seconds for wire protocols that only speak seconds, rounded up
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}
