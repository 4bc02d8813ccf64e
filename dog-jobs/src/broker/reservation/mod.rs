//! Broker speaking the beanstalk-style reservation protocol over TCP.
//!
//! Each pipeline maps to one tube. The server keeps the job until it is
//! deleted; a reserved job that is neither deleted nor released becomes
//! ready again once its time-to-run (TTR) elapses. Redeliveries caused by
//! TTR expiry do not advance the attempt count, since the stored body is
//! unchanged.
//!
//! Reservations are owned by the connection that made them, so that
//! connection leaves the pool with the reservation and only returns once
//! the job is acked, nacked or buried. Producers and `stats-tube` share
//! the remaining idle connections.

mod pool;
mod protocol;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use self::pool::{ConnectionPool, ReconnectSupervisor};
use self::protocol::{Connection, Reserved};
use crate::broker::{ceil_secs, envelope, Broker};
use crate::retry::BackoffPolicy;
use crate::types::{BrokerCapabilities, Job, JobId, PipelineStat, Reservation, ReservationToken};
use crate::{JobsError, JobsResult};

/// Connection section of a `reservation-protocol` pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// `host:port` of the server
    pub addr: String,
    /// Tube name; defaults to the pipeline name
    pub tube: Option<String>,
    /// Visibility timeout of a reservation
    #[serde(with = "humantime_serde")]
    pub ttr: Duration,
    pub priority: u32,
    pub max_payload: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub reconnect: BackoffPolicy,
    pub max_idle: usize,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:11300".to_string(),
            tube: None,
            ttr: Duration::from_secs(60),
            priority: 1024,
            max_payload: 65_535,
            connect_timeout: Duration::from_secs(5),
            reconnect: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30)),
            max_idle: 16,
        }
    }
}

impl ReservationConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }
}

/// Connection holding a reservation, keyed by server job id
type Held = Arc<tokio::sync::Mutex<Connection>>;

pub struct ReservationBroker {
    pipeline: String,
    tube: String,
    config: ReservationConfig,
    pool: Arc<ConnectionPool>,
    held: Mutex<HashMap<u64, Held>>,
    cancel: CancellationToken,
}

impl ReservationBroker {
    /// Dial the server and start the reconnect supervisor.
    ///
    /// An unreachable server is not an error here: the broker starts in
    /// the disconnected state and the supervisor keeps dialing.
    pub async fn connect(
        pipeline: impl Into<String>,
        config: ReservationConfig,
    ) -> JobsResult<Self> {
        let pipeline = pipeline.into();
        let tube = config.tube.clone().unwrap_or_else(|| pipeline.clone());
        validate_tube(&tube)?;

        let pool = Arc::new(ConnectionPool::new(
            pipeline.clone(),
            config.addr.clone(),
            tube.clone(),
            config.connect_timeout,
            config.max_idle.max(1),
        ));

        match pool.open().await {
            Ok(conn) => {
                pool.checkin(conn);
                pool.mark_up();
                debug!("Connected to {} for {}", config.addr, pipeline);
            }
            Err(err) => warn!(
                "Reservation server {} unreachable for {}, reconnecting in background: {}",
                config.addr, pipeline, err
            ),
        }

        let cancel = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(pool.clone(), config.reconnect);
        tokio::spawn(supervisor.run(cancel.clone()));

        Ok(Self {
            pipeline,
            tube,
            config,
            pool,
            held: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_healthy()
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    async fn wait_until_connected(&self, timeout: Duration) -> JobsResult<()> {
        if self.pool.is_healthy() {
            return Ok(());
        }

        let mut health = self.pool.subscribe();
        let recovered = tokio::time::timeout(timeout, async {
            health.wait_for(|up| *up).await.is_ok()
        })
        .await
        .unwrap_or(false);
        if recovered {
            Ok(())
        } else {
            Err(JobsError::BrokerUnavailable(format!(
                "{} is unreachable",
                self.config.addr
            )))
        }
    }

    /// Reservations currently pinned to their connection
    pub fn held_reservations(&self) -> usize {
        self.held.lock().len()
    }

    fn encode(&self, job: &Job) -> JobsResult<Vec<u8>> {
        let body = envelope::encode(job)?;
        if body.len() > self.config.max_payload {
            return Err(JobsError::InvalidPayload(format!(
                "encoded job of {} bytes exceeds the {} byte limit",
                body.len(),
                self.config.max_payload
            )));
        }
        Ok(body)
    }

    async fn put(&self, job: &Job, delay: Duration) -> JobsResult<u64> {
        let body = self.encode(job)?;

        let mut conn = self.pool.checkout().await?;
        let result = conn
            .put(self.config.priority, ceil_secs(delay), self.ttr_secs(), &body)
            .await;
        self.pool.finish(conn, &result);
        result
    }

    fn take_held(&self, id: u64) -> Option<Held> {
        self.held.lock().remove(&id)
    }

    /// Return a resolved reservation's connection to the pool
    fn give_back<T>(&self, held: Held, result: &JobsResult<T>) {
        match Arc::try_unwrap(held) {
            Ok(conn) => self.pool.finish(conn.into_inner(), result),
            Err(_) => debug!(
                "Connection of a resolved job on {} still busy, dropping it",
                self.tube
            ),
        }
    }

    fn ttr_secs(&self) -> u64 {
        ceil_secs(self.config.ttr).max(1)
    }
}

fn validate_tube(tube: &str) -> JobsResult<()> {
    let valid = !tube.is_empty()
        && tube.len() <= 200
        && !tube.starts_with('-')
        && tube
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c));

    if valid {
        Ok(())
    } else {
        Err(JobsError::Configuration(format!("invalid tube name: {tube:?}")))
    }
}

fn server_id(token: &ReservationToken) -> JobsResult<u64> {
    token
        .as_str()
        .parse()
        .map_err(|_| JobsError::Reservation(format!("malformed reservation token: {token}")))
}

impl Drop for ReservationBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Broker for ReservationBroker {
    async fn push(&self, job: Job) -> JobsResult<JobId> {
        let delay = job.options.delay;
        let id = self.put(&job, delay).await?;
        debug!("Stored job {} as {} in tube {}", job.id, id, self.tube);
        Ok(job.id)
    }

    async fn reserve(&self, timeout: Duration) -> JobsResult<Option<Reservation>> {
        self.wait_until_connected(timeout).await?;

        let mut conn = self.pool.checkout().await?;
        let result = conn.reserve(ceil_secs(timeout)).await;
        let (id, body) = match result {
            Ok(Reserved::Job { id, body }) => (id, body),
            other => {
                self.pool.finish(conn, &other);
                return other.map(|_| None);
            }
        };

        match envelope::decode(&body) {
            Ok(job) => {
                self.held.lock().insert(id, Arc::new(tokio::sync::Mutex::new(conn)));
                Ok(Some(Reservation::new(job, ReservationToken(id.to_string()))))
            }
            Err(err) => {
                error!(
                    "Burying undecodable job {} ({} bytes) in tube {}: {}",
                    id,
                    body.len(),
                    self.tube,
                    err
                );
                let buried = conn.bury(id, self.config.priority).await;
                self.pool.finish(conn, &buried);
                buried?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, reservation: &Reservation) -> JobsResult<()> {
        let id = server_id(&reservation.token)?;
        let Some(held) = self.take_held(id) else {
            debug!("Ack for job {} not held on tube {}, ignoring", id, self.tube);
            return Ok(());
        };

        let result = held.lock().await.delete(id).await;
        self.give_back(held, &result);
        if !result? {
            warn!(
                "Job {} was no longer reserved in tube {} when acked, its TTR had elapsed",
                id, self.tube
            );
        }
        Ok(())
    }

    /// Store the next delivery with its attempt count bumped, then drop
    /// the reserved copy, both on the connection holding the reservation.
    /// A crash in between yields a duplicate, never a lost job. If the
    /// retry cannot be stored the reservation is released unchanged.
    async fn nack(&self, reservation: &Reservation, requeue_after: Duration) -> JobsResult<()> {
        let id = server_id(&reservation.token)?;
        let Some(held) = self.take_held(id) else {
            debug!("Nack for job {} not held on tube {}, ignoring", id, self.tube);
            return Ok(());
        };

        let mut next = reservation.job.clone();
        next.attempt = next.attempt.saturating_add(1);
        let delay = ceil_secs(requeue_after);

        let result = {
            let mut conn = held.lock().await;
            let stored = match self.encode(&next) {
                Ok(body) => conn.put(self.config.priority, delay, self.ttr_secs(), &body).await,
                Err(err) => Err(err),
            };
            match stored {
                Ok(_) => conn.delete(id).await,
                Err(err @ JobsError::BrokerUnavailable(_)) => Err(err),
                Err(err) => {
                    warn!(
                        "Could not store retry of job {} in tube {}, releasing it: {}",
                        id, self.tube, err
                    );
                    conn.release(id, self.config.priority, delay).await
                }
            }
        };

        self.give_back(held, &result);
        if !result? {
            warn!(
                "Job {} was no longer reserved in tube {} when nacked, its TTR had elapsed",
                id, self.tube
            );
        }
        Ok(())
    }

    /// `touch` restarts the TTR; the server does not accept a custom length
    async fn extend(&self, reservation: &Reservation, _by: Duration) -> JobsResult<()> {
        let id = server_id(&reservation.token)?;
        let held = self.held.lock().get(&id).cloned();
        let Some(held) = held else {
            return Err(JobsError::Reservation(format!(
                "job {id} is not reserved by this broker"
            )));
        };

        let result = held.lock().await.touch(id).await;
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(JobsError::Reservation(format!(
                "job {id} is no longer reserved"
            ))),
            Err(err) => {
                if matches!(err, JobsError::BrokerUnavailable(_)) {
                    self.take_held(id);
                    self.pool.mark_down(&err);
                }
                Err(err)
            }
        }
    }

    async fn stat(&self) -> JobsResult<PipelineStat> {
        let mut conn = self.pool.checkout().await?;
        let result = conn.stats_tube(&self.tube).await;
        self.pool.finish(conn, &result);

        let stats = result?;
        Ok(PipelineStat {
            queued: stats.ready,
            reserved: stats.reserved,
            delayed: stats.delayed,
        })
    }

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities {
            delayed: true,
            lease_extend: true,
            native_attempts: false,
            ordered: false,
        }
    }

    /// Dropping the held connections hands their jobs back to the server
    async fn close(&self) -> JobsResult<()> {
        self.cancel.cancel();
        self.held.lock().clear();
        self.pool.clear();
        debug!("Closed reservation broker for {}", self.pipeline);
        Ok(())
    }
}
