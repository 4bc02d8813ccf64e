//! Handlers compiled into the server binary.

use async_trait::async_trait;
use dog_jobs::{Job, JobHandler, Outcome};
use tracing::info;

/// Logs each job and acks it.
///
/// Installed as the default handler so pipelines listed under `consume`
/// run without application code; real deployments register their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, job: Job) -> Outcome {
        info!(
            pipeline = %job.pipeline,
            job_id = %job.id,
            attempt = job.attempt,
            size = job.payload.len(),
            "Handled job"
        );
        Outcome::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_jobs::JobOptions;

    #[tokio::test]
    async fn acks_every_job() {
        let job = Job::new("emails", "hello", JobOptions::default());
        assert_eq!(LogHandler.handle(job).await, Outcome::Ack);
    }
}
