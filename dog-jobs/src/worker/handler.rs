use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::types::Job;
use crate::JobError;

/// What a handler decided about one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Done; remove the job
    Ack,
    /// Failed; requeue while attempts remain. A delay overrides the
    /// retry policy for this retry.
    Retry(Option<Duration>),
    /// Never retry; move to the dead-letter queue with a reason
    DeadLetter(String),
}

impl Outcome {
    pub fn retry() -> Self {
        Self::Retry(None)
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self::Retry(Some(delay))
    }

    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::DeadLetter(reason.into())
    }
}

impl From<JobError> for Outcome {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Retryable(_) => Self::Retry(None),
            JobError::Permanent(reason) => Self::DeadLetter(reason),
        }
    }
}

impl From<Result<(), JobError>> for Outcome {
    fn from(result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(err) => err.into(),
        }
    }
}

/// Consumer-side job processing.
///
/// Async closures taking a [`Job`] implement this trait:
///
/// ```rust,no_run
/// use dog_jobs::prelude::*;
///
/// # async fn demo(queue: JobQueue) -> JobsResult<()> {
/// queue.consume("emails", |job: Job| async move {
///     match job.payload_str() {
///         Some(_) => Outcome::Ack,
///         None => Outcome::dead_letter("payload is not text"),
///     }
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Outcome;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Outcome {
        (self)(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobOptions;

    #[test]
    fn job_errors_map_to_outcomes() {
        assert_eq!(Outcome::from(Ok(())), Outcome::Ack);
        assert_eq!(
            Outcome::from(Err(JobError::retryable("smtp down"))),
            Outcome::Retry(None)
        );
        assert_eq!(
            Outcome::from(Err(JobError::permanent("bad address"))),
            Outcome::DeadLetter("bad address".into())
        );
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |job: Job| async move {
            if job.payload == "ok" {
                Outcome::Ack
            } else {
                Outcome::retry_after(Duration::from_secs(1))
            }
        };

        let ok = Job::new("emails", "ok", JobOptions::default());
        let bad = Job::new("emails", "bad", JobOptions::default());
        assert_eq!(handler.handle(ok).await, Outcome::Ack);
        assert_eq!(
            handler.handle(bad).await,
            Outcome::Retry(Some(Duration::from_secs(1)))
        );
    }
}
