//! Broker backed by a managed cloud queue with an SQS-style JSON API.
//!
//! Every action is a `POST` to the endpoint with an `X-Amz-Target`
//! header naming it. The reservation token is the receipt handle and the
//! attempt count comes from the queue's own receive counter, so
//! visibility timeouts count as attempts.

mod api;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error};

use self::api::{
    ApiError, ChangeMessageVisibility, DeleteMessage, GetQueueAttributes,
    GetQueueAttributesResult, ReceiveMessage, ReceiveMessageResult, SendMessage,
    SendMessageResult,
};
use crate::broker::{ceil_secs, envelope, Broker};
use crate::types::{BrokerCapabilities, Job, JobId, PipelineStat, Reservation, ReservationToken};
use crate::{JobsError, JobsResult};

const MAX_BATCH: usize = 10;
const MAX_WAIT_SECS: u64 = 20;
const MAX_VISIBILITY_SECS: u64 = 43_200;

/// Connection section of a `cloud-queue` pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudQueueConfig {
    pub endpoint: String,
    pub queue_url: String,
    /// Sent as a bearer token when present
    pub token: Option<String>,
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
    /// Upper bound of a long poll
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,
    pub max_payload: usize,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CloudQueueConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9324".to_string(),
            queue_url: String::new(),
            token: None,
            visibility_timeout: Duration::from_secs(30),
            wait_time: Duration::from_secs(20),
            max_payload: 256 * 1024,
            max_delay: Duration::from_secs(900),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl CloudQueueConfig {
    pub fn new(endpoint: impl Into<String>, queue_url: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            queue_url: queue_url.into(),
            ..Self::default()
        }
    }
}

pub struct CloudQueueBroker {
    pipeline: String,
    config: CloudQueueConfig,
    client: reqwest::Client,
    prefetch: usize,
    /// Messages received in a batch but not yet handed to a consumer
    buffer: Mutex<VecDeque<Reservation>>,
}

impl CloudQueueBroker {
    pub fn new(
        pipeline: impl Into<String>,
        config: CloudQueueConfig,
        prefetch: usize,
    ) -> JobsResult<Self> {
        let pipeline = pipeline.into();

        if config.queue_url.is_empty() {
            return Err(JobsError::Configuration(format!(
                "pipeline {pipeline}: cloud-queue requires queue_url"
            )));
        }
        if config.request_timeout <= config.wait_time {
            return Err(JobsError::Configuration(format!(
                "pipeline {pipeline}: request_timeout must exceed wait_time"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| JobsError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            pipeline,
            config,
            client,
            prefetch: prefetch.clamp(1, MAX_BATCH),
            buffer: Mutex::new(VecDeque::new()),
        })
    }

    async fn call<Req, Res>(&self, action: &str, body: &Req) -> JobsResult<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned + Default,
    {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("X-Amz-Target", format!("AmazonSQS.{action}"))
            .header(CONTENT_TYPE, "application/x-amz-json-1.0")
            .body(serde_json::to_vec(body)?);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| JobsError::BrokerUnavailable(format!("{action}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| JobsError::BrokerUnavailable(format!("{action}: {e}")))?;
            if bytes.is_empty() {
                return Ok(Res::default());
            }
            return serde_json::from_slice(&bytes)
                .map_err(|e| JobsError::Protocol(format!("{action}: invalid response: {e}")));
        }

        let error: ApiError = response.json().await.unwrap_or_default();
        let message = format!("{action} failed with {status}: {} {}", error.kind, error.message);

        Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            JobsError::BrokerUnavailable(message)
        } else if error.kind.contains("ReceiptHandle")
            || error.kind.contains("MessageNotInflight")
        {
            JobsError::Reservation(message)
        } else {
            JobsError::Protocol(message)
        })
    }

    async fn change_visibility(
        &self,
        reservation: &Reservation,
        after: Duration,
    ) -> JobsResult<()> {
        let _: Value = self
            .call(
                "ChangeMessageVisibility",
                &ChangeMessageVisibility {
                    queue_url: &self.config.queue_url,
                    receipt_handle: reservation.token.as_str(),
                    visibility_timeout: ceil_secs(after).min(MAX_VISIBILITY_SECS),
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for CloudQueueBroker {
    async fn push(&self, job: Job) -> JobsResult<JobId> {
        if job.options.delay > self.config.max_delay {
            return Err(JobsError::InvalidPayload(format!(
                "delay of {:?} exceeds the queue maximum of {:?}",
                job.options.delay, self.config.max_delay
            )));
        }

        let body = String::from_utf8(envelope::encode(&job)?)
            .map_err(|e| JobsError::Internal(format!("envelope is not UTF-8: {e}")))?;
        if body.len() > self.config.max_payload {
            return Err(JobsError::InvalidPayload(format!(
                "encoded job of {} bytes exceeds the {} byte limit",
                body.len(),
                self.config.max_payload
            )));
        }

        let result: SendMessageResult = self
            .call(
                "SendMessage",
                &SendMessage {
                    queue_url: &self.config.queue_url,
                    message_body: &body,
                    delay_seconds: ceil_secs(job.options.delay),
                },
            )
            .await?;

        debug!("Sent job {} as message {} on {}", job.id, result.message_id, self.pipeline);
        Ok(job.id)
    }

    async fn reserve(&self, timeout: Duration) -> JobsResult<Option<Reservation>> {
        let buffered = self.buffer.lock().pop_front();
        if buffered.is_some() {
            return Ok(buffered);
        }

        let wait = ceil_secs(timeout.min(self.config.wait_time)).min(MAX_WAIT_SECS);
        let result: ReceiveMessageResult = self
            .call(
                "ReceiveMessage",
                &ReceiveMessage {
                    queue_url: &self.config.queue_url,
                    max_number_of_messages: self.prefetch,
                    wait_time_seconds: wait,
                    visibility_timeout: ceil_secs(self.config.visibility_timeout),
                    attribute_names: vec![api::RECEIVE_COUNT],
                },
            )
            .await?;

        let mut reservations = VecDeque::with_capacity(result.messages.len());
        for message in result.messages {
            match envelope::decode(message.body.as_bytes()) {
                Ok(mut job) => {
                    job.attempt = message.previous_deliveries();
                    reservations.push_back(Reservation::new(
                        job,
                        ReservationToken(message.receipt_handle),
                    ));
                }
                // Left in flight: the queue's redrive policy owns poison messages
                Err(err) => error!(
                    "Skipping undecodable message {} on {}: {}",
                    message.message_id, self.pipeline, err
                ),
            }
        }

        let first = reservations.pop_front();
        if !reservations.is_empty() {
            self.buffer.lock().extend(reservations);
        }
        Ok(first)
    }

    async fn ack(&self, reservation: &Reservation) -> JobsResult<()> {
        let result: JobsResult<Value> = self
            .call(
                "DeleteMessage",
                &DeleteMessage {
                    queue_url: &self.config.queue_url,
                    receipt_handle: reservation.token.as_str(),
                },
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(JobsError::Reservation(reason)) => {
                debug!(
                    "Ack of job {} on {} ignored: {}",
                    reservation.job.id, self.pipeline, reason
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn nack(&self, reservation: &Reservation, requeue_after: Duration) -> JobsResult<()> {
        match self.change_visibility(reservation, requeue_after).await {
            Err(JobsError::Reservation(reason)) => {
                debug!(
                    "Nack of job {} on {} ignored: {}",
                    reservation.job.id, self.pipeline, reason
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn extend(&self, reservation: &Reservation, by: Duration) -> JobsResult<()> {
        self.change_visibility(reservation, by).await
    }

    async fn stat(&self) -> JobsResult<PipelineStat> {
        let result: GetQueueAttributesResult = self
            .call(
                "GetQueueAttributes",
                &GetQueueAttributes {
                    queue_url: &self.config.queue_url,
                    attribute_names: vec![api::VISIBLE, api::NOT_VISIBLE, api::DELAYED],
                },
            )
            .await?;

        Ok(PipelineStat {
            queued: result.count(api::VISIBLE),
            reserved: result.count(api::NOT_VISIBLE),
            delayed: result.count(api::DELAYED),
        })
    }

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities {
            delayed: true,
            lease_extend: true,
            native_attempts: true,
            ordered: false,
        }
    }

    /// Buffered messages are dropped and reappear after their visibility timeout
    async fn close(&self) -> JobsResult<()> {
        let dropped = {
            let mut buffer = self.buffer.lock();
            let dropped = buffer.len();
            buffer.clear();
            dropped
        };
        if dropped > 0 {
            debug!("Released {} prefetched messages on {}", dropped, self.pipeline);
        }
        Ok(())
    }
}
