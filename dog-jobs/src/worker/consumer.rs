use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::handler::{JobHandler, Outcome};
use crate::dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterReason};
use crate::observability::ObservabilityLayer;
use crate::pipeline::{Pipeline, PipelineRegistry};
use crate::retry::{self, RetryDecision};
use crate::types::{Job, JobId, JobOptions, Reservation};
use crate::JobEvent;

/// Heartbeats extend a reservation by this many heartbeat intervals
const HEARTBEAT_LEASE_FACTOR: u32 = 3;

/// State shared by every consumer of one pool
pub(crate) struct ConsumerContext {
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) handler: RwLock<Arc<dyn JobHandler>>,
    pub(crate) registry: Arc<PipelineRegistry>,
    pub(crate) dead_letters: Arc<DeadLetterQueue>,
    pub(crate) observability: ObservabilityLayer,
    /// Job each consumer is currently running, by consumer index
    pub(crate) in_flight: Mutex<HashMap<usize, JobId>>,
}

/// How the consumer resolves a finished delivery
enum Resolution {
    Ack,
    Retry { delay: Option<Duration>, cause: String },
    DeadLetter(String),
}

impl From<Outcome> for Resolution {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Ack => Self::Ack,
            Outcome::Retry(delay) => Self::Retry {
                delay,
                cause: "handler requested a retry".to_string(),
            },
            Outcome::DeadLetter(reason) => Self::DeadLetter(reason),
        }
    }
}

/// Aborts the handler task if the consumer is dropped mid-delivery
struct AbortOnDrop(JoinHandle<Outcome>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct Consumer {
    index: usize,
    ctx: Arc<ConsumerContext>,
    cancel: CancellationToken,
}

impl Consumer {
    pub(crate) fn new(index: usize, ctx: Arc<ConsumerContext>, cancel: CancellationToken) -> Self {
        Self { index, ctx, cancel }
    }

    /// Loop until cancelled. A delivery in progress is always resolved
    /// before the loop checks for cancellation again.
    pub(crate) async fn run(self) {
        let pipeline = self.ctx.pipeline.clone();
        let config = pipeline.config();
        let mut paused = pipeline.subscribe_paused();
        let mut errors: u32 = 0;

        debug!("Consumer {} of {} started", self.index, pipeline.name());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let is_paused = *paused.borrow_and_update();
            if is_paused {
                debug!("Consumer {} of {} waiting for resume", self.index, pipeline.name());
                let resumed = tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    resumed = async { paused.wait_for(|paused| !*paused).await.is_ok() } => resumed,
                };
                if !resumed {
                    break;
                }
                continue;
            }

            match pipeline.broker().reserve(config.reserve_timeout).await {
                Ok(Some(reservation)) => {
                    errors = 0;
                    self.process(reservation).await;
                }
                Ok(None) => errors = 0,
                Err(err) => {
                    let delay = config.retry.next(errors);
                    errors = errors.saturating_add(1);
                    warn!(
                        "Reserve on {} failed ({} in a row), backing off {:?}: {}",
                        pipeline.name(),
                        errors,
                        delay,
                        err
                    );
                    self.ctx.observability.record(JobEvent::BrokerError {
                        pipeline: pipeline.name().to_string(),
                        error: err.to_string(),
                        at: Utc::now(),
                    });

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!("Consumer {} of {} stopped", self.index, pipeline.name());
    }

    async fn process(&self, reservation: Reservation) {
        let job = &reservation.job;
        self.ctx.observability.record(JobEvent::Reserved {
            job_id: job.id.clone(),
            pipeline: self.ctx.pipeline.name().to_string(),
            attempt: job.attempt,
            at: Utc::now(),
        });

        // Redeliveries after visibility timeouts can use up the budget
        // without the handler ever resolving the job.
        if job.attempt >= job.options.max_attempts {
            let reason = DeadLetterReason::AttemptsExceeded {
                attempts: job.attempt,
                last_error: "visibility timeout elapsed without a resolution".to_string(),
            };
            self.dead_letter(&reservation, reason).await;
            return;
        }

        self.ctx.in_flight.lock().insert(self.index, job.id.clone());
        let resolution = self.execute(&reservation).await;
        self.resolve(&reservation, resolution).await;
        self.ctx.in_flight.lock().remove(&self.index);
    }

    /// Run the handler in its own task under the job deadline, extending
    /// the reservation while it runs
    async fn execute(&self, reservation: &Reservation) -> Resolution {
        let config = self.ctx.pipeline.config();
        let broker = self.ctx.pipeline.broker();
        let handler = self.ctx.handler.read().clone();

        let job = reservation.job.clone();
        let timeout = job.options.timeout.or(config.timeout);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(job).await }));

        let heartbeat_enabled = broker.capabilities().lease_extend;
        let lease = config.heartbeat.saturating_mul(HEARTBEAT_LEASE_FACTOR);
        let mut heartbeat = interval_at(Instant::now() + config.heartbeat, config.heartbeat);

        loop {
            tokio::select! {
                joined = &mut task.0 => {
                    return match joined {
                        Ok(outcome) => outcome.into(),
                        Err(err) if err.is_panic() => Resolution::Retry {
                            delay: None,
                            cause: format!("handler panicked: {}", panic_message(err.into_panic())),
                        },
                        Err(err) => Resolution::Retry {
                            delay: None,
                            cause: format!("handler task failed: {err}"),
                        },
                    };
                }
                _ = deadline_elapsed(deadline) => {
                    task.0.abort();
                    warn!(
                        "Job {} on {} exceeded its {:?} deadline",
                        reservation.job.id,
                        self.ctx.pipeline.name(),
                        timeout.unwrap_or_default()
                    );
                    return Resolution::Retry {
                        delay: None,
                        cause: format!("handler timed out after {:?}", timeout.unwrap_or_default()),
                    };
                }
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    if let Err(err) = broker.extend(reservation, lease).await {
                        warn!(
                            "Heartbeat for job {} on {} failed, it may be delivered twice: {}",
                            reservation.job.id,
                            self.ctx.pipeline.name(),
                            err
                        );
                    }
                }
            }
        }
    }

    async fn resolve(&self, reservation: &Reservation, resolution: Resolution) {
        let pipeline = self.ctx.pipeline.name();
        let broker = self.ctx.pipeline.broker();
        let job = &reservation.job;

        match resolution {
            Resolution::Ack => match broker.ack(reservation).await {
                Ok(()) => {
                    debug!("Job {} on {} completed", job.id, pipeline);
                    self.ctx.observability.record(JobEvent::Acked {
                        job_id: job.id.clone(),
                        pipeline: pipeline.to_string(),
                        at: Utc::now(),
                    });
                }
                Err(err) => warn!(
                    "Ack of job {} on {} failed, it will be redelivered: {}",
                    job.id, pipeline, err
                ),
            },

            Resolution::Retry { delay, cause } => {
                match retry::decide(job, delay, &self.ctx.pipeline.config().retry) {
                    RetryDecision::Requeue(after) => match broker.nack(reservation, after).await {
                        Ok(()) => {
                            warn!(
                                "Job {} on {} failed on attempt {} ({}), retrying in {:?}",
                                job.id,
                                pipeline,
                                job.attempt + 1,
                                cause,
                                after
                            );
                            let retry_in = chrono::Duration::from_std(after)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                            self.ctx.observability.record(JobEvent::Retrying {
                                job_id: job.id.clone(),
                                pipeline: pipeline.to_string(),
                                attempt: job.attempt + 1,
                                retry_at: Utc::now() + retry_in,
                                error: cause,
                                at: Utc::now(),
                            });
                        }
                        Err(err) => warn!(
                            "Nack of job {} on {} failed, it returns after its visibility timeout: {}",
                            job.id, pipeline, err
                        ),
                    },
                    RetryDecision::DeadLetter => {
                        let reason = DeadLetterReason::AttemptsExceeded {
                            attempts: job.attempt + 1,
                            last_error: cause,
                        };
                        self.dead_letter(reservation, reason).await;
                    }
                }
            }

            Resolution::DeadLetter(reason) => {
                self.dead_letter(reservation, DeadLetterReason::Rejected { reason })
                    .await;
            }
        }
    }

    /// Record the job as dead, forward it if configured, then ack it
    async fn dead_letter(&self, reservation: &Reservation, reason: DeadLetterReason) {
        let pipeline = self.ctx.pipeline.name();
        let job = &reservation.job;
        error!("Dead-lettering job {} on {}: {}", job.id, pipeline, reason);

        if let Some(target) = &self.ctx.pipeline.config().dead_letter {
            self.forward(target, job).await;
        }

        let event = JobEvent::DeadLettered {
            job_id: job.id.clone(),
            pipeline: pipeline.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        };
        self.ctx
            .dead_letters
            .record(DeadLetter::new(job.clone(), reason));
        self.ctx.observability.record(event);

        if let Err(err) = self.ctx.pipeline.broker().ack(reservation).await {
            warn!(
                "Ack of dead-lettered job {} on {} failed, it may be delivered again: {}",
                job.id, pipeline, err
            );
        }
    }

    /// Push a copy of the job, same id, onto the dead-letter pipeline
    async fn forward(&self, target: &str, job: &Job) {
        let result = match self.ctx.registry.resolve(target) {
            Ok(pipeline) => {
                let mut forwarded = Job::new(
                    target,
                    job.payload.clone(),
                    JobOptions {
                        max_attempts: pipeline.config().max_attempts,
                        ..JobOptions::default()
                    },
                );
                forwarded.id = job.id.clone();
                pipeline.broker().push(forwarded).await.map(|_| ())
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            warn!(
                "Could not forward dead-lettered job {} to {}: {}",
                job.id, target, err
            );
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
