//! In-process broker.
//!
//! Jobs live in memory only and are lost when the process exits.
//! Zero-delay jobs are delivered in push order.

mod reaper;
mod storage;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::reaper::LeaseReaper;
use self::storage::LocalState;
use crate::broker::Broker;
use crate::types::{BrokerCapabilities, Job, JobId, PipelineStat, Reservation, ReservationToken};
use crate::{JobsError, JobsResult};

/// Connection section of a `local` pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Maximum number of jobs held, counting delayed and reserved ones
    pub capacity: usize,
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
    /// Maximum payload size in bytes
    pub max_payload: usize,
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            visibility_timeout: Duration::from_secs(60),
            max_payload: 1024 * 1024,
            reap_interval: Duration::from_secs(1),
        }
    }
}

impl LocalConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

pub struct LocalBroker {
    pipeline: String,
    config: LocalConfig,
    state: Arc<Mutex<LocalState>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl LocalBroker {
    /// Create the broker and start its lease reaper on the current runtime
    pub fn new(pipeline: impl Into<String>, config: LocalConfig) -> Self {
        let pipeline = pipeline.into();
        let state = Arc::new(Mutex::new(LocalState::default()));
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let interval = if config.reap_interval.is_zero() {
            LocalConfig::default().reap_interval
        } else {
            config.reap_interval
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let reaper =
                    LeaseReaper::new(pipeline.clone(), state.clone(), notify.clone(), interval);
                handle.spawn(reaper.start(cancel.clone()));
            }
            Err(_) => warn!(
                "No runtime for the lease reaper of {}, expired reservations are reclaimed on reserve",
                pipeline
            ),
        }

        Self {
            pipeline,
            config,
            state,
            notify,
            cancel,
        }
    }

    pub fn with_defaults(pipeline: impl Into<String>) -> Self {
        Self::new(pipeline, LocalConfig::default())
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Force a reservation's visibility timeout to elapse (test helper)
    pub fn expire_reservation(&self, token: &ReservationToken) -> bool {
        self.state.lock().expire(token, Instant::now())
    }

    /// Run one reaper cycle now (test helper)
    pub fn reap_now(&self) -> usize {
        LeaseReaper::new(
            self.pipeline.clone(),
            self.state.clone(),
            self.notify.clone(),
            self.config.reap_interval,
        )
        .reap_expired_leases()
    }
}

impl Drop for LocalBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn push(&self, job: Job) -> JobsResult<JobId> {
        if job.payload.len() > self.config.max_payload {
            return Err(JobsError::InvalidPayload(format!(
                "payload of {} bytes exceeds the {} byte limit",
                job.payload.len(),
                self.config.max_payload
            )));
        }

        let job_id = job.id.clone();
        {
            let mut state = self.state.lock();
            if state.len() >= self.config.capacity {
                return Err(JobsError::QueueFull {
                    pipeline: self.pipeline.clone(),
                    capacity: self.config.capacity,
                });
            }
            let delay = job.options.delay;
            state.enqueue(job, delay, Instant::now());
        }

        self.notify.notify_waiters();
        Ok(job_id)
    }

    async fn reserve(&self, timeout: Duration) -> JobsResult<Option<Reservation>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before looking, so a push between the
            // check and the wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.promote_due(now);
                state.reclaim_expired(now);

                if let Some(reservation) = state.take_next(self.config.visibility_timeout, now) {
                    return Ok(Some(reservation));
                }
                state.next_due()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, reservation: &Reservation) -> JobsResult<()> {
        if self.state.lock().release(&reservation.token).is_none() {
            debug!(
                "Ack for unknown reservation of job {} on {}, ignoring",
                reservation.job.id, self.pipeline
            );
        }
        Ok(())
    }

    async fn nack(&self, reservation: &Reservation, requeue_after: Duration) -> JobsResult<()> {
        {
            let mut state = self.state.lock();
            match state.release(&reservation.token) {
                Some(job) => state.enqueue(job, requeue_after, Instant::now()),
                None => {
                    debug!(
                        "Nack for unknown reservation of job {} on {}, ignoring",
                        reservation.job.id, self.pipeline
                    );
                    return Ok(());
                }
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, reservation: &Reservation, by: Duration) -> JobsResult<()> {
        if self.state.lock().extend(&reservation.token, by, Instant::now()) {
            Ok(())
        } else {
            Err(JobsError::Reservation(format!(
                "reservation of job {} is no longer held",
                reservation.job.id
            )))
        }
    }

    async fn stat(&self) -> JobsResult<PipelineStat> {
        let mut state = self.state.lock();
        state.promote_due(Instant::now());
        Ok(state.stat())
    }

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities {
            delayed: true,
            lease_extend: true,
            native_attempts: true,
            ordered: true,
        }
    }

    async fn close(&self) -> JobsResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobOptions;

    fn job(payload: &'static str) -> Job {
        Job::new("local", payload, JobOptions::default())
    }

    #[tokio::test]
    async fn reserve_times_out_on_empty_pipeline() {
        let broker = LocalBroker::with_defaults("local");
        let reserved = broker.reserve(Duration::from_millis(20)).await.unwrap();
        assert!(reserved.is_none());
    }

    #[tokio::test]
    async fn waiting_reserver_wakes_on_push() {
        let broker = Arc::new(LocalBroker::with_defaults("local"));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.reserve(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = broker.push(job("wake")).await.unwrap();

        let reservation = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(reservation.job.id, id);
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_due() {
        let broker = LocalBroker::with_defaults("local");
        let mut delayed = job("later");
        delayed.options.delay = Duration::from_millis(50);
        broker.push(delayed).await.unwrap();

        assert!(broker.reserve(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(broker.stat().await.unwrap().delayed, 1);

        let reservation = broker.reserve(Duration::from_secs(2)).await.unwrap();
        assert!(reservation.is_some());
    }

    #[tokio::test]
    async fn capacity_and_payload_limits() {
        let broker = LocalBroker::new(
            "local",
            LocalConfig {
                capacity: 1,
                max_payload: 4,
                ..LocalConfig::default()
            },
        );

        assert!(matches!(
            broker.push(job("too large")).await,
            Err(JobsError::InvalidPayload(_))
        ));
        broker.push(job("ok")).await.unwrap();
        assert!(matches!(
            broker.push(job("full")).await,
            Err(JobsError::QueueFull { capacity: 1, .. })
        ));
    }

    #[tokio::test]
    async fn extend_fails_for_released_reservation() {
        let broker = LocalBroker::with_defaults("local");
        broker.push(job("a")).await.unwrap();
        let reservation = broker.reserve(Duration::ZERO).await.unwrap().unwrap();

        broker.extend(&reservation, Duration::from_secs(30)).await.unwrap();
        broker.ack(&reservation).await.unwrap();
        assert!(broker.extend(&reservation, Duration::from_secs(30)).await.is_err());
    }
}
