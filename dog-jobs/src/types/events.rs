use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Stable event protocol for structured observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job accepted by the pipeline's broker
    Pushed {
        job_id: JobId,
        pipeline: String,
        at: DateTime<Utc>,
    },

    /// Broker refused the job
    PushFailed {
        pipeline: String,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job handed to a consumer
    Reserved {
        job_id: JobId,
        pipeline: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// Job completed and removed from the broker
    Acked {
        job_id: JobId,
        pipeline: String,
        at: DateTime<Utc>,
    },

    /// Job failed and was requeued
    Retrying {
        job_id: JobId,
        pipeline: String,
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job moved to the dead-letter queue
    DeadLettered {
        job_id: JobId,
        pipeline: String,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Job left unresolved by a drain past its grace period
    Abandoned {
        job_id: JobId,
        pipeline: String,
        at: DateTime<Utc>,
    },

    PipelineStarted {
        pipeline: String,
        at: DateTime<Utc>,
    },

    PipelinePaused {
        pipeline: String,
        at: DateTime<Utc>,
    },

    PipelineResumed {
        pipeline: String,
        at: DateTime<Utc>,
    },

    PipelineStopped {
        pipeline: String,
        at: DateTime<Utc>,
    },

    /// Transport failure seen by a consumer
    BrokerError {
        pipeline: String,
        error: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Pushed { .. } => "pushed",
            Self::PushFailed { .. } => "push_failed",
            Self::Reserved { .. } => "reserved",
            Self::Acked { .. } => "acked",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Abandoned { .. } => "abandoned",
            Self::PipelineStarted { .. } => "pipeline_started",
            Self::PipelinePaused { .. } => "pipeline_paused",
            Self::PipelineResumed { .. } => "pipeline_resumed",
            Self::PipelineStopped { .. } => "pipeline_stopped",
            Self::BrokerError { .. } => "broker_error",
        }
    }

    /// Job the event is about, if any
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Pushed { job_id, .. }
            | Self::Reserved { job_id, .. }
            | Self::Acked { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Abandoned { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    pub fn pipeline(&self) -> &str {
        match self {
            Self::Pushed { pipeline, .. }
            | Self::PushFailed { pipeline, .. }
            | Self::Reserved { pipeline, .. }
            | Self::Acked { pipeline, .. }
            | Self::Retrying { pipeline, .. }
            | Self::DeadLettered { pipeline, .. }
            | Self::Abandoned { pipeline, .. }
            | Self::PipelineStarted { pipeline, .. }
            | Self::PipelinePaused { pipeline, .. }
            | Self::PipelineResumed { pipeline, .. }
            | Self::PipelineStopped { pipeline, .. }
            | Self::BrokerError { pipeline, .. } => pipeline,
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Pushed { at, .. }
            | Self::PushFailed { at, .. }
            | Self::Reserved { at, .. }
            | Self::Acked { at, .. }
            | Self::Retrying { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Abandoned { at, .. }
            | Self::PipelineStarted { at, .. }
            | Self::PipelinePaused { at, .. }
            | Self::PipelineResumed { at, .. }
            | Self::PipelineStopped { at, .. }
            | Self::BrokerError { at, .. } => at,
        }
    }
}
