//! Service lifecycle and the jobs service.
//!
//! A process is a fixed list of services driven through
//! `init`, then `serve`, then `stop` by the host binary.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::JobsConfig;
use crate::dispatcher::JobQueue;
use crate::pipeline::PipelineRegistry;
use crate::worker::JobHandler;
use crate::{JobsError, JobsResult};

/// Process-wide state handed to every service at init
#[derive(Debug, Clone, Default)]
pub struct AppContext {
    config: Value,
}

impl AppContext {
    pub fn new(config: Value) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Top-level config section, `Value::Null` when absent
    pub fn section(&self, name: &str) -> Value {
        self.config.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// A long-running component of the process
#[async_trait]
pub trait Service: Send + Sync {
    fn id(&self) -> &'static str;

    /// Build resources from configuration. Errors here are fatal.
    async fn init(&mut self, ctx: &AppContext) -> JobsResult<()>;

    /// Run until `stop` is called
    async fn serve(&self) -> JobsResult<()>;

    async fn stop(&self) -> JobsResult<()>;
}

/// Hosts the job queue: registers pipelines at init, consumes the
/// configured ones while serving, drains them at stop
pub struct JobsService {
    config: Option<JobsConfig>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    default_handler: Option<Arc<dyn JobHandler>>,
    queue: Option<JobQueue>,
    shutdown: CancellationToken,
}

impl JobsService {
    /// Configuration is read from the `jobs` section at init
    pub fn new() -> Self {
        Self {
            config: None,
            handlers: HashMap::new(),
            default_handler: None,
            queue: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use `config` instead of the context's `jobs` section
    pub fn with_config(mut self, config: JobsConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_handler<H: JobHandler>(mut self, pipeline: impl Into<String>, handler: H) -> Self {
        self.handlers.insert(pipeline.into(), Arc::new(handler));
        self
    }

    /// Handler for consumed pipelines without their own
    pub fn with_default_handler<H: JobHandler>(mut self, handler: H) -> Self {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// The queue built by `init`
    pub fn queue(&self) -> JobsResult<&JobQueue> {
        self.queue
            .as_ref()
            .ok_or_else(|| JobsError::Internal("jobs service is not initialized".to_string()))
    }

    fn handler_for(&self, pipeline: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(pipeline)
            .cloned()
            .or_else(|| self.default_handler.clone())
    }
}

impl Default for JobsService {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards to a shared handler so a single instance can serve a pipeline
struct SharedHandler(Arc<dyn JobHandler>);

#[async_trait]
impl JobHandler for SharedHandler {
    async fn handle(&self, job: crate::types::Job) -> crate::worker::Outcome {
        self.0.handle(job).await
    }
}

#[async_trait]
impl Service for JobsService {
    fn id(&self) -> &'static str {
        "jobs"
    }

    async fn init(&mut self, ctx: &AppContext) -> JobsResult<()> {
        let config = match self.config.take() {
            Some(config) => config,
            None => JobsConfig::from_value(ctx.section("jobs"))?,
        };
        config.validate()?;

        let registry = Arc::new(PipelineRegistry::new());
        for (name, pipeline) in &config.pipelines {
            registry.register(name, pipeline).await?;
        }

        for name in &config.consume {
            if self.handler_for(name).is_none() {
                return Err(JobsError::Configuration(format!(
                    "pipeline {name} is consumed but has no handler"
                )));
            }
        }

        info!(
            "Jobs service initialized with {} pipelines, consuming {:?}",
            registry.len(),
            config.consume
        );
        self.queue = Some(
            JobQueue::new(registry)
                .with_dispatch_rules(config.dispatch.clone())
                .with_dead_letter_capacity(config.dead_letter_capacity)
                .with_grace_period(config.grace_period),
        );
        self.config = Some(config);
        Ok(())
    }

    async fn serve(&self) -> JobsResult<()> {
        let queue = self.queue()?;
        let consume = self
            .config
            .as_ref()
            .map(|config| config.consume.clone())
            .unwrap_or_default();

        for name in &consume {
            let handler = self.handler_for(name).ok_or_else(|| {
                JobsError::Configuration(format!("pipeline {name} is consumed but has no handler"))
            })?;
            queue.consume(name, SharedHandler(handler)).await?;
        }

        self.shutdown.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> JobsResult<()> {
        if let Some(queue) = &self.queue {
            queue.stop().await;
        }
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Job, PushOptions};
    use crate::worker::{Outcome, PoolState};
    use serde_json::json;
    use std::time::Duration;

    fn context() -> AppContext {
        AppContext::new(json!({
            "jobs": {
                "grace_period": "1s",
                "consume": ["emails"],
                "pipelines": {
                    "emails": { "broker": "local", "reserve_timeout": "20ms" },
                    "reports": { "broker": "local" }
                }
            }
        }))
    }

    #[tokio::test]
    async fn init_registers_configured_pipelines() {
        let mut service =
            JobsService::new().with_handler("emails", |_job: Job| async { Outcome::Ack });
        service.init(&context()).await.unwrap();

        let queue = service.queue().unwrap();
        assert_eq!(queue.registry().names(), vec!["emails", "reports"]);
    }

    #[tokio::test]
    async fn consumed_pipeline_without_handler_is_fatal() {
        let mut service = JobsService::new();
        let err = service.init(&context()).await.unwrap_err();
        assert!(matches!(err, JobsError::Configuration(_)));
    }

    #[tokio::test]
    async fn unknown_broker_is_fatal() {
        let ctx = AppContext::new(json!({
            "jobs": { "pipelines": { "emails": { "broker": "smoke-signals" } } }
        }));
        let err = JobsService::new().init(&ctx).await.unwrap_err();
        assert_eq!(err, JobsError::UnknownBrokerKind("smoke-signals".to_string()));
    }

    #[tokio::test]
    async fn serve_consumes_until_stopped() {
        let mut service =
            JobsService::new().with_default_handler(|_job: Job| async { Outcome::Ack });
        service.init(&context()).await.unwrap();
        let service = Arc::new(service);

        let serving = tokio::spawn({
            let service = service.clone();
            async move { service.serve().await }
        });

        let queue = service.queue().unwrap().clone();
        let mut events = queue.events();
        queue.push("emails", "hi", PushOptions::new()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(crate::JobEvent::Acked { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.pool_state("emails").unwrap(), PoolState::Running);
        assert_eq!(queue.pool_state("reports").unwrap(), PoolState::Stopped);

        service.stop().await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(queue.pool_state("emails").unwrap(), PoolState::Stopped);
    }
}
