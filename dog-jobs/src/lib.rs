//! # dog-jobs: Pluggable Job Queue Engine
//!
//! **At-least-once background jobs over interchangeable brokers**
//!
//! Producers push opaque payloads onto named pipelines. Each pipeline is
//! bound to one broker, and a worker pool per pipeline reserves jobs,
//! runs a handler and resolves every delivery with an ack, a delayed
//! retry or a move to the dead-letter queue.
//!
//! ## Features
//!
//! - **Three brokers**: in-process `local`, a line-based
//!   `reservation-protocol` over TCP, and an HTTP `cloud-queue`
//! - **Reservations with visibility timeouts**: a crashed consumer's job
//!   comes back, a finished one never does
//! - **Retry budget**: exponential backoff with cap and optional jitter,
//!   per-job overrides, dead-lettering once attempts run out
//! - **Graceful drain**: in-flight jobs get a grace period and are never
//!   force-acked
//! - **Structured observability**: an event stream plus live counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_jobs::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> JobsResult<()> {
//! let registry = Arc::new(PipelineRegistry::new());
//! registry
//!     .register("emails", &PipelineConfig::new("local").with_consume(
//!         ConsumeConfig::default().with_concurrency(4).with_max_attempts(3),
//!     ))
//!     .await?;
//!
//! let queue = JobQueue::new(registry);
//! queue
//!     .consume("emails", |job: Job| async move {
//!         tracing::info!("sending {}", job.payload_str().unwrap_or_default());
//!         Outcome::Ack
//!     })
//!     .await?;
//!
//! queue.push("emails", "hello", PushOptions::new()).await?;
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod service;
pub mod types;
pub mod worker;

pub use broker::{Broker, BrokerKind};
pub use config::{ConsumeConfig, DispatchRule, JobsConfig, PipelineConfig};
pub use dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason};
pub use dispatcher::JobQueue;
pub use error::{JobError, JobsError, JobsResult};
pub use observability::{LiveMetrics, ObservabilityLayer, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineRegistry};
pub use retry::{BackoffPolicy, RetryDecision};
pub use service::{AppContext, JobsService, Service};
pub use types::{
    BrokerCapabilities, Job, JobEvent, JobId, JobOptions, PipelineStat, PushOptions,
    Reservation, ReservationToken, RetryDelay,
};
pub use worker::{DrainReport, JobHandler, Outcome, PoolState};

pub mod prelude {
    pub use crate::{
        ConsumeConfig, JobQueue, PipelineConfig, PipelineRegistry,
    };

    pub use crate::{
        Job, JobError, JobEvent, JobId, JobsError, JobsResult, Outcome, PushOptions,
    };

    pub use crate::JobHandler;

    pub use async_trait::async_trait;
}
