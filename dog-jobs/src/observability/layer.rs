use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use super::LiveMetrics;
use crate::JobEvent;

/// Event broadcast plus the counters derived from it
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// `capacity` bounds how far a slow subscriber may lag before it
    /// starts missing events
    pub fn with_capacity(capacity: usize) -> Self {
        let (event_broadcaster, _) = broadcast::channel(capacity.max(1));

        Self {
            event_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Count the event and publish it to subscribers
    pub fn record(&self, event: JobEvent) {
        let pipeline = event.pipeline();
        match &event {
            JobEvent::Pushed { .. } => self.metrics.increment_pushed(pipeline),
            JobEvent::PushFailed { .. } => self.metrics.increment_push_failed(pipeline),
            JobEvent::Reserved { .. } => self.metrics.increment_reserved(pipeline),
            JobEvent::Acked { .. } => self.metrics.increment_acked(pipeline),
            JobEvent::Retrying { .. } => self.metrics.increment_retried(pipeline),
            JobEvent::DeadLettered { .. } => self.metrics.increment_dead_lettered(pipeline),
            JobEvent::Abandoned { .. } => self.metrics.increment_abandoned(pipeline),
            JobEvent::BrokerError { .. } => self.metrics.increment_broker_errors(pipeline),
            JobEvent::PipelineStarted { .. }
            | JobEvent::PipelinePaused { .. }
            | JobEvent::PipelineResumed { .. }
            | JobEvent::PipelineStopped { .. } => {}
        }

        trace!("Recorded {} on {}", event.event_name(), pipeline);
        let _ = self.event_broadcaster.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<JobEvent> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobId;
    use chrono::Utc;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn records_count_and_stream() {
        let layer = ObservabilityLayer::new();
        let mut events = layer.event_stream();

        layer.record(JobEvent::Pushed {
            job_id: JobId::from("j1"),
            pipeline: "emails".into(),
            at: Utc::now(),
        });

        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("Timeout waiting for event")
            .expect("Stream ended")
            .expect("Event receive error");
        assert_eq!(event.event_name(), "pushed");
        assert_eq!(layer.metrics().pipeline("emails").pushed, 1);
    }

    #[test]
    fn recording_without_subscribers_is_fine() {
        let layer = ObservabilityLayer::with_capacity(1);
        layer.record(JobEvent::PipelineStarted {
            pipeline: "emails".into(),
            at: Utc::now(),
        });
        assert_eq!(layer.metrics().totals().pushed, 0);
    }
}
