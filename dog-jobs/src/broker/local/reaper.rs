use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::storage::LocalState;

/// Visibility-timeout reaper: requeues reservations nobody resolved in time
pub(crate) struct LeaseReaper {
    pipeline: String,
    state: Arc<Mutex<LocalState>>,
    notify: Arc<Notify>,
    interval: Duration,
}

impl LeaseReaper {
    pub(crate) fn new(
        pipeline: impl Into<String>,
        state: Arc<Mutex<LocalState>>,
        notify: Arc<Notify>,
        interval: Duration,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            state,
            notify,
            interval,
        }
    }

    /// Run until `cancel` fires
    pub(crate) async fn start(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Starting lease reaper for {} with interval: {:?}", self.pipeline, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reclaimed = self.reap_expired_leases();
                    if reclaimed > 0 {
                        info!("Reclaimed {} expired reservations on {}", reclaimed, self.pipeline);
                    }
                }
            }
        }

        debug!("Lease reaper for {} stopped", self.pipeline);
    }

    /// Run one reaper cycle, returning the number of requeued jobs
    pub(crate) fn reap_expired_leases(&self) -> usize {
        let reclaimed = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.promote_due(now);
            state.reclaim_expired(now)
        };

        for job_id in &reclaimed {
            debug!("Visibility timeout elapsed for job {} on {}", job_id, self.pipeline);
        }

        if !reclaimed.is_empty() {
            self.notify.notify_waiters();
        }
        reclaimed.len()
    }
}
