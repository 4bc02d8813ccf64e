//! Producer and consumer entry point over a pipeline registry.

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::DispatchRule;
use crate::dead_letter::DeadLetterQueue;
use crate::observability::{LiveMetrics, ObservabilityLayer};
use crate::pipeline::PipelineRegistry;
use crate::types::{Job, JobId, PipelineStat, PushOptions};
use crate::worker::{DrainReport, JobHandler, PoolState, WorkerPool};
use crate::{JobEvent, JobsError, JobsResult};

/// Pushes jobs onto pipelines and runs their worker pools.
///
/// Cheap to clone; clones share pipelines, pools and the dead-letter queue.
#[derive(Clone)]
pub struct JobQueue {
    registry: Arc<PipelineRegistry>,
    rules: Arc<BTreeMap<String, DispatchRule>>,
    pools: Arc<RwLock<HashMap<String, Arc<WorkerPool>>>>,
    dead_letters: Arc<DeadLetterQueue>,
    observability: ObservabilityLayer,
    grace_period: Duration,
}

impl JobQueue {
    pub fn new(registry: Arc<PipelineRegistry>) -> Self {
        Self {
            registry,
            rules: Arc::new(BTreeMap::new()),
            pools: Arc::new(RwLock::new(HashMap::new())),
            dead_letters: Arc::new(DeadLetterQueue::default()),
            observability: ObservabilityLayer::new(),
            grace_period: Duration::from_secs(30),
        }
    }

    /// Job-name patterns used by [`JobQueue::dispatch`]
    pub fn with_dispatch_rules(mut self, rules: BTreeMap<String, DispatchRule>) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letters = Arc::new(DeadLetterQueue::new(capacity));
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    /// Push a payload onto a pipeline
    #[instrument(skip(self, payload, options), fields(size))]
    pub async fn push(
        &self,
        pipeline: &str,
        payload: impl Into<Bytes>,
        options: PushOptions,
    ) -> JobsResult<JobId> {
        let payload = payload.into();
        tracing::Span::current().record("size", payload.len());

        let target = self.registry.resolve(pipeline)?;
        let result = match options.resolve(target.config().max_attempts) {
            Ok(options) => target.broker().push(Job::new(pipeline, payload, options)).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(job_id) => {
                debug!("Pushed job {} onto {}", job_id, pipeline);
                self.observability.record(JobEvent::Pushed {
                    job_id: job_id.clone(),
                    pipeline: pipeline.to_string(),
                    at: Utc::now(),
                });
            }
            Err(err) => {
                warn!("Push onto {} failed: {}", pipeline, err);
                self.observability.record(JobEvent::PushFailed {
                    pipeline: pipeline.to_string(),
                    error: err.to_string(),
                    at: Utc::now(),
                });
            }
        }
        result
    }

    /// Push a job by name, routed by the dispatch rules.
    ///
    /// An exact pattern wins; otherwise the longest matching `prefix*`
    /// pattern. Options given here win over the rule's defaults.
    pub async fn dispatch(
        &self,
        job_name: &str,
        payload: impl Into<Bytes>,
        options: PushOptions,
    ) -> JobsResult<JobId> {
        let rule = self.route(job_name).ok_or_else(|| {
            JobsError::PipelineNotFound(format!("no dispatch rule matches job {job_name}"))
        })?;
        let options = options.or(&rule.options);
        self.push(&rule.pipeline, payload, options).await
    }

    /// Dispatch rule a job name resolves to
    pub fn route(&self, job_name: &str) -> Option<&DispatchRule> {
        if let Some(rule) = self.rules.get(job_name) {
            return Some(rule);
        }

        self.rules
            .iter()
            .filter_map(|(pattern, rule)| {
                let prefix = pattern.strip_suffix('*')?;
                job_name.starts_with(prefix).then_some((prefix.len(), rule))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, rule)| rule)
    }

    /// Start consuming a pipeline with `handler`.
    ///
    /// Calling this again for a running pipeline swaps the handler for
    /// subsequent deliveries. While the pipeline is draining the call
    /// waits for the drain to end, then starts the pool again.
    pub async fn consume<H: JobHandler>(&self, pipeline: &str, handler: H) -> JobsResult<()> {
        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        let target = self.registry.resolve(pipeline)?;

        let pool = {
            let mut pools = self.pools.write();
            match pools.get(pipeline) {
                Some(pool) => {
                    pool.set_handler(handler);
                    pool.clone()
                }
                None => {
                    let pool = Arc::new(WorkerPool::new(
                        target,
                        handler,
                        self.registry.clone(),
                        self.dead_letters.clone(),
                        self.observability.clone(),
                    ));
                    pools.insert(pipeline.to_string(), pool.clone());
                    pool
                }
            }
        };

        if !pool.start().await {
            debug!("Pool of {} already running, handler replaced", pipeline);
        }
        Ok(())
    }

    /// Stop admitting reservations on a pipeline. In-flight jobs finish.
    pub fn pause(&self, pipeline: &str) -> JobsResult<()> {
        if self.registry.pause(pipeline)? {
            info!("Paused {}", pipeline);
            self.observability.record(JobEvent::PipelinePaused {
                pipeline: pipeline.to_string(),
                at: Utc::now(),
            });
        }
        Ok(())
    }

    pub fn resume(&self, pipeline: &str) -> JobsResult<()> {
        if self.registry.resume(pipeline)? {
            info!("Resumed {}", pipeline);
            self.observability.record(JobEvent::PipelineResumed {
                pipeline: pipeline.to_string(),
                at: Utc::now(),
            });
        }
        Ok(())
    }

    pub fn is_paused(&self, pipeline: &str) -> JobsResult<bool> {
        Ok(self.registry.resolve(pipeline)?.is_paused())
    }

    pub async fn stat(&self, pipeline: &str) -> JobsResult<PipelineStat> {
        self.registry.resolve(pipeline)?.broker().stat().await
    }

    /// `Stopped` for pipelines that were never consumed
    pub fn pool_state(&self, pipeline: &str) -> JobsResult<PoolState> {
        self.registry.resolve(pipeline)?;
        Ok(self
            .pools
            .read()
            .get(pipeline)
            .map(|pool| pool.state())
            .unwrap_or(PoolState::Stopped))
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.observability.subscribe()
    }

    pub fn metrics(&self) -> &LiveMetrics {
        self.observability.metrics()
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    /// Drain one pipeline's pool. `grace` defaults to the pipeline's grace
    /// period, then the queue's.
    pub async fn stop_pipeline(
        &self,
        pipeline: &str,
        grace: Option<Duration>,
    ) -> JobsResult<DrainReport> {
        let target = self.registry.resolve(pipeline)?;
        let pool = self.pools.read().get(pipeline).cloned();
        let grace = grace
            .or(target.config().grace_period)
            .unwrap_or(self.grace_period);

        Ok(match pool {
            Some(pool) => pool.stop(grace).await,
            None => DrainReport::default(),
        })
    }

    /// Drain every pool concurrently, then close the brokers
    pub async fn stop(&self) -> DrainReport {
        let pools: Vec<Arc<WorkerPool>> = self.pools.read().values().cloned().collect();
        info!("Stopping {} worker pools", pools.len());

        let reports = join_all(pools.iter().map(|pool| {
            let grace = pool.pipeline().config().grace_period.unwrap_or(self.grace_period);
            pool.stop(grace)
        }))
        .await;

        let report = reports.into_iter().fold(DrainReport::default(), |mut total, report| {
            total.finished += report.finished;
            total.aborted += report.aborted;
            total.abandoned += report.abandoned;
            total
        });

        for pipeline in self.registry.all() {
            if let Err(err) = pipeline.broker().close().await {
                warn!("Closing broker of {} failed: {}", pipeline.name(), err);
            }
        }

        info!(
            "Job queue stopped: {} jobs abandoned across {} pools",
            report.abandoned,
            pools.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    async fn queue_with_rules() -> JobQueue {
        let registry = Arc::new(PipelineRegistry::new());
        for name in ["emails", "sms", "default"] {
            registry.register(name, &PipelineConfig::new("local")).await.unwrap();
        }

        let mut rules = BTreeMap::new();
        rules.insert("mail.*".to_string(), DispatchRule::new("emails"));
        rules.insert("mail.urgent.*".to_string(), DispatchRule::new("sms"));
        rules.insert("report".to_string(), DispatchRule::new("default"));
        rules.insert("*".to_string(), DispatchRule::new("default"));
        JobQueue::new(registry).with_dispatch_rules(rules)
    }

    #[tokio::test]
    async fn routes_by_exact_then_longest_prefix() {
        let queue = queue_with_rules().await;

        assert_eq!(queue.route("mail.welcome").unwrap().pipeline, "emails");
        assert_eq!(queue.route("mail.urgent.reset").unwrap().pipeline, "sms");
        assert_eq!(queue.route("report").unwrap().pipeline, "default");
        assert_eq!(queue.route("anything").unwrap().pipeline, "default");
    }

    #[tokio::test]
    async fn unmatched_dispatch_fails() {
        let registry = Arc::new(PipelineRegistry::new());
        let queue = JobQueue::new(registry);

        let err = queue.dispatch("mail.welcome", "hi", PushOptions::new()).await.unwrap_err();
        assert!(matches!(err, JobsError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn push_to_unknown_pipeline_fails() {
        let queue = queue_with_rules().await;
        let err = queue.push("fax", "hi", PushOptions::new()).await.unwrap_err();
        assert_eq!(err, JobsError::PipelineNotFound("fax".to_string()));
    }

    #[tokio::test]
    async fn push_records_event_and_counts() {
        let queue = queue_with_rules().await;
        let mut events = queue.events();

        let id = queue.push("emails", "hi", PushOptions::new()).await.unwrap();
        match events.recv().await.unwrap() {
            JobEvent::Pushed { job_id, pipeline, .. } => {
                assert_eq!(job_id, id);
                assert_eq!(pipeline, "emails");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(queue.stat("emails").await.unwrap().queued, 1);
        assert_eq!(queue.metrics().pipeline("emails").pushed, 1);
    }

    #[tokio::test]
    async fn zero_attempts_is_refused_at_push() {
        let queue = queue_with_rules().await;
        let err = queue
            .push("emails", "hi", PushOptions::new().max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, JobsError::InvalidPayload(_)));
        assert_eq!(queue.metrics().pipeline("emails").push_failed, 1);
        assert_eq!(queue.stat("emails").await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn pool_state_of_unconsumed_pipeline_is_stopped() {
        let queue = queue_with_rules().await;
        assert_eq!(queue.pool_state("emails").unwrap(), PoolState::Stopped);
        assert!(queue.pool_state("fax").is_err());
    }
}
