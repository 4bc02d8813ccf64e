use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::protocol::Connection;
use crate::retry::BackoffPolicy;
use crate::{JobsError, JobsResult};

/// Idle connections to one server and tube, plus the shared health flag
pub(crate) struct ConnectionPool {
    pipeline: String,
    addr: String,
    tube: String,
    connect_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
    healthy: watch::Sender<bool>,
}

impl ConnectionPool {
    pub(crate) fn new(
        pipeline: impl Into<String>,
        addr: impl Into<String>,
        tube: impl Into<String>,
        connect_timeout: Duration,
        max_idle: usize,
    ) -> Self {
        let (healthy, _) = watch::channel(false);
        Self {
            pipeline: pipeline.into(),
            addr: addr.into(),
            tube: tube.into(),
            connect_timeout,
            max_idle,
            idle: Mutex::new(Vec::new()),
            healthy,
        }
    }

    pub(crate) fn is_healthy(&self) -> bool {
        *self.healthy.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.healthy.subscribe()
    }

    /// Dial a fresh connection, bypassing the idle list
    pub(crate) async fn open(&self) -> JobsResult<Connection> {
        Connection::open(&self.addr, &self.tube, self.connect_timeout).await
    }

    /// Take an idle connection or dial a new one. Fails fast while the
    /// server is known to be unreachable.
    pub(crate) async fn checkout(&self) -> JobsResult<Connection> {
        if !self.is_healthy() {
            return Err(JobsError::BrokerUnavailable(format!(
                "{} is unreachable, reconnecting",
                self.addr
            )));
        }

        let idle = self.idle.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => match self.open().await {
                Ok(conn) => Ok(conn),
                Err(err) => {
                    self.mark_down(&err);
                    Err(err)
                }
            },
        }
    }

    pub(crate) fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    /// Return the connection unless the operation left it unusable
    pub(crate) fn finish<T>(&self, conn: Connection, result: &JobsResult<T>) {
        match result {
            Ok(_) | Err(JobsError::InvalidPayload(_)) => self.checkin(conn),
            Err(err @ JobsError::BrokerUnavailable(_)) => {
                drop(conn);
                self.mark_down(err);
            }
            // Framing may be out of sync after a protocol error
            Err(_) => drop(conn),
        }
    }

    pub(crate) fn mark_up(&self) {
        self.healthy.send_replace(true);
    }

    pub(crate) fn mark_down(&self, err: &JobsError) {
        let was_up = self.healthy.send_replace(false);
        self.idle.lock().clear();
        if was_up {
            warn!("Lost connection to {} for {}: {}", self.addr, self.pipeline, err);
        }
    }

    pub(crate) fn clear(&self) {
        self.idle.lock().clear();
    }
}

/// Background task that redials the server whenever the pool goes down
pub(crate) struct ReconnectSupervisor {
    pool: Arc<ConnectionPool>,
    policy: BackoffPolicy,
}

impl ReconnectSupervisor {
    pub(crate) fn new(pool: Arc<ConnectionPool>, policy: BackoffPolicy) -> Self {
        Self { pool, policy }
    }

    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut health = self.pool.subscribe();

        loop {
            let went_down = tokio::select! {
                _ = cancel.cancelled() => false,
                down = async { health.wait_for(|up| !*up).await.is_ok() } => down,
            };
            if !went_down {
                return;
            }

            let mut attempt = 0;
            loop {
                match self.pool.open().await {
                    Ok(conn) => {
                        self.pool.checkin(conn);
                        self.pool.mark_up();
                        info!("Connected to {} for {}", self.pool.addr, self.pool.pipeline);
                        break;
                    }
                    Err(err) => {
                        let delay = self.policy.next(attempt);
                        attempt = attempt.saturating_add(1);
                        warn!(
                            "Reconnect to {} for {} failed (attempt {}), retrying in {:?}: {}",
                            self.pool.addr, self.pool.pipeline, attempt, delay, err
                        );

                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}
