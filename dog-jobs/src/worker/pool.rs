use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::consumer::{Consumer, ConsumerContext};
use super::handler::JobHandler;
use crate::dead_letter::DeadLetterQueue;
use crate::observability::ObservabilityLayer;
use crate::pipeline::{Pipeline, PipelineRegistry};
use crate::JobEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Running,
    /// No new reservations; in-flight jobs are finishing
    Draining,
}

/// What happened to the consumers of a pool during a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Consumers that exited within the grace period
    pub finished: usize,
    /// Consumers cancelled when the grace period ran out
    pub aborted: usize,
    /// Jobs left reserved by aborted consumers. The broker redelivers
    /// them once their visibility timeout elapses.
    pub abandoned: usize,
}

struct PoolInner {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Fixed set of consumers bound to one pipeline
pub struct WorkerPool {
    ctx: Arc<ConsumerContext>,
    state: Mutex<PoolState>,
    /// Held across a whole start or drain
    inner: tokio::sync::Mutex<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        pipeline: Arc<Pipeline>,
        handler: Arc<dyn JobHandler>,
        registry: Arc<PipelineRegistry>,
        dead_letters: Arc<DeadLetterQueue>,
        observability: ObservabilityLayer,
    ) -> Self {
        Self {
            ctx: Arc::new(ConsumerContext {
                pipeline,
                handler: parking_lot::RwLock::new(handler),
                registry,
                dead_letters,
                observability,
                in_flight: Mutex::new(HashMap::new()),
            }),
            state: Mutex::new(PoolState::Stopped),
            inner: tokio::sync::Mutex::new(PoolInner {
                cancel: CancellationToken::new(),
                tasks: Vec::new(),
            }),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.ctx.pipeline
    }

    /// Replace the handler. Deliveries already running keep the old one.
    pub fn set_handler(&self, handler: Arc<dyn JobHandler>) {
        *self.ctx.handler.write() = handler;
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Spawn the consumers. Returns `false` if the pool is already running.
    ///
    /// A drain holds the pool lock until it completes, so a start issued
    /// while draining runs once the pool is stopped.
    pub async fn start(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if self.state() != PoolState::Stopped {
            return false;
        }

        let pipeline = self.ctx.pipeline.name().to_string();
        let concurrency = self.ctx.pipeline.config().concurrency;
        let cancel = CancellationToken::new();

        inner.tasks = (0..concurrency)
            .map(|index| {
                let consumer = Consumer::new(index, self.ctx.clone(), cancel.child_token());
                tokio::spawn(consumer.run())
            })
            .collect();
        inner.cancel = cancel;
        *self.state.lock() = PoolState::Running;

        info!("Started {} consumers on {}", concurrency, pipeline);
        self.ctx.observability.record(JobEvent::PipelineStarted {
            pipeline,
            at: Utc::now(),
        });
        true
    }

    /// Stop reserving and wait up to `grace` for in-flight jobs.
    ///
    /// Consumers still busy when the grace period ends are cancelled and
    /// their jobs are left to the broker's visibility timeout. Nothing is
    /// acked on their behalf.
    pub async fn stop(&self, grace: Duration) -> DrainReport {
        let mut inner = self.inner.lock().await;
        if self.state() == PoolState::Stopped {
            return DrainReport::default();
        }

        let pipeline = self.ctx.pipeline.name().to_string();
        *self.state.lock() = PoolState::Draining;
        inner.cancel.cancel();
        info!("Draining {} with a grace period of {:?}", pipeline, grace);

        let deadline = Instant::now() + grace;
        let mut report = DrainReport::default();
        for mut task in inner.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => report.finished += 1,
                Ok(Err(err)) => {
                    warn!("Consumer on {} ended abnormally: {}", pipeline, err);
                    report.finished += 1;
                }
                Err(_) => {
                    task.abort();
                    let _ = task.await;
                    report.aborted += 1;
                }
            }
        }

        let abandoned: Vec<_> = self.ctx.in_flight.lock().drain().map(|(_, id)| id).collect();
        report.abandoned = abandoned.len();
        for job_id in abandoned {
            warn!("Abandoned job {} on {} past the grace period", job_id, pipeline);
            self.ctx.observability.record(JobEvent::Abandoned {
                job_id,
                pipeline: pipeline.clone(),
                at: Utc::now(),
            });
        }

        *self.state.lock() = PoolState::Stopped;
        info!(
            "Stopped {}: {} consumers finished, {} aborted, {} jobs abandoned",
            pipeline, report.finished, report.aborted, report.abandoned
        );
        self.ctx.observability.record(JobEvent::PipelineStopped {
            pipeline,
            at: Utc::now(),
        });
        report
    }
}
