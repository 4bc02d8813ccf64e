//! Pipeline registry: name to broker plus consume configuration.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::broker::{self, Broker};
use crate::config::{ConsumeConfig, PipelineConfig};
use crate::{JobsError, JobsResult};

/// A named broker binding. Owns its broker exclusively.
pub struct Pipeline {
    name: String,
    broker: Arc<dyn Broker>,
    config: ConsumeConfig,
    paused: watch::Sender<bool>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("paused", &*self.paused.borrow())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>, config: ConsumeConfig) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            name: name.into(),
            broker,
            config,
            paused,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &ConsumeConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stop admitting new reservations. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        self.set_paused(true)
    }

    /// Returns `false` if the pipeline was not paused
    pub fn resume(&self) -> bool {
        self.set_paused(false)
    }

    pub(crate) fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    fn set_paused(&self, value: bool) -> bool {
        self.paused.send_if_modified(|paused| {
            if *paused == value {
                false
            } else {
                *paused = value;
                true
            }
        })
    }
}

/// Read-mostly map of registered pipelines
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the configured broker and register the pipeline
    pub async fn register(&self, name: &str, config: &PipelineConfig) -> JobsResult<Arc<Pipeline>> {
        if self.contains(name) {
            return Err(JobsError::DuplicatePipeline(name.to_string()));
        }
        config.consume.validate(name)?;

        let broker = broker::build(name, config).await?;
        let pipeline = self.insert(Pipeline::new(name, broker, config.consume.clone()))?;
        info!("Registered pipeline {} ({})", name, config.broker);
        Ok(pipeline)
    }

    /// Register a pipeline around an already constructed broker
    pub fn register_broker(
        &self,
        name: &str,
        broker: Arc<dyn Broker>,
        config: ConsumeConfig,
    ) -> JobsResult<Arc<Pipeline>> {
        config.validate(name)?;
        self.insert(Pipeline::new(name, broker, config))
    }

    fn insert(&self, pipeline: Pipeline) -> JobsResult<Arc<Pipeline>> {
        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(pipeline.name()) {
            return Err(JobsError::DuplicatePipeline(pipeline.name().to_string()));
        }

        let pipeline = Arc::new(pipeline);
        pipelines.insert(pipeline.name().to_string(), pipeline.clone());
        Ok(pipeline)
    }

    pub fn resolve(&self, name: &str) -> JobsResult<Arc<Pipeline>> {
        self.pipelines
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobsError::PipelineNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.read().contains_key(name)
    }

    pub fn pause(&self, name: &str) -> JobsResult<bool> {
        Ok(self.resolve(name)?.pause())
    }

    pub fn resume(&self, name: &str) -> JobsResult<bool> {
        Ok(self.resolve(name)?.resume())
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<Pipeline>> {
        let mut pipelines: Vec<Arc<Pipeline>> = self.pipelines.read().values().cloned().collect();
        pipelines.sort_by(|a, b| a.name().cmp(b.name()));
        pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn register_and_resolve() {
        let registry = PipelineRegistry::new();
        assert_ok!(registry.register("emails", &PipelineConfig::new("local")).await);

        let pipeline = assert_ok!(registry.resolve("emails"));
        assert_eq!(pipeline.name(), "emails");
        assert_eq!(registry.names(), vec!["emails".to_string()]);

        let err = assert_err!(registry.resolve("sms"));
        assert!(matches!(err, JobsError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let registry = PipelineRegistry::new();
        registry
            .register("emails", &PipelineConfig::new("local"))
            .await
            .unwrap();

        let err = registry
            .register("emails", &PipelineConfig::new("local"))
            .await
            .unwrap_err();
        assert_eq!(err, JobsError::DuplicatePipeline("emails".to_string()));

        let err = registry
            .register_broker(
                "emails",
                Arc::new(LocalBroker::with_defaults("emails")),
                ConsumeConfig::default(),
            )
            .unwrap_err();
        assert_eq!(err, JobsError::DuplicatePipeline("emails".to_string()));
    }

    #[tokio::test]
    async fn unknown_broker_kind_is_rejected() {
        let registry = PipelineRegistry::new();
        let err = registry
            .register("emails", &PipelineConfig::new("carrier-pigeon"))
            .await
            .unwrap_err();
        assert_eq!(err, JobsError::UnknownBrokerKind("carrier-pigeon".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn debug_output_names_the_pipeline() {
        let pipeline = Pipeline::new(
            "emails",
            Arc::new(LocalBroker::with_defaults("emails")),
            ConsumeConfig::default(),
        );
        pipeline.pause();

        let rendered = format!("{pipeline:?}");
        assert!(rendered.starts_with("Pipeline {"));
        assert!(rendered.contains("name: \"emails\""));
        assert!(rendered.contains("paused: true"));
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_admission() {
        let registry = PipelineRegistry::new();
        let pipeline = registry
            .register("emails", &PipelineConfig::new("local"))
            .await
            .unwrap();
        let mut paused = pipeline.subscribe_paused();

        assert!(registry.pause("emails").unwrap());
        assert!(!registry.pause("emails").unwrap());
        assert!(pipeline.is_paused());
        assert!(paused.has_changed().unwrap());

        assert!(registry.resume("emails").unwrap());
        assert!(!pipeline.is_paused());
    }
}
