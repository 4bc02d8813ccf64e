use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::Instant;

use dog_jobs::broker::{Broker, CloudQueueBroker, CloudQueueConfig};
use dog_jobs::prelude::*;
use dog_jobs::JobOptions;

struct FakeMessage {
    id: String,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

/// In-memory stand-in for the queue service, single queue
#[derive(Default)]
struct FakeQueue {
    messages: Mutex<Vec<FakeMessage>>,
    calls: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<Value>>,
    failing: AtomicBool,
    next_id: Mutex<u64>,
}

impl FakeQueue {
    fn calls(&self, action: &str) -> usize {
        self.calls.lock().get(action).copied().unwrap_or_default()
    }

    fn receive(&self, max: usize, visibility: u64) -> Vec<Value> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        messages
            .iter_mut()
            .filter(|message| message.visible_at <= now)
            .take(max)
            .map(|message| {
                message.receive_count += 1;
                let receipt = format!("rh-{}-{}", message.id, message.receive_count);
                message.receipt = Some(receipt.clone());
                message.visible_at = now + Duration::from_secs(visibility);
                json!({
                    "MessageId": message.id,
                    "ReceiptHandle": receipt,
                    "Body": message.body,
                    "Attributes": { "ApproximateReceiveCount": message.receive_count.to_string() }
                })
            })
            .collect()
    }
}

fn api_error(status: StatusCode, kind: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "__type": kind, "message": "rejected by fake" })))
}

async fn handle(
    State(queue): State<Arc<FakeQueue>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let action = headers
        .get("X-Amz-Target")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("AmazonSQS."))
        .unwrap_or_default()
        .to_string();
    *queue.calls.lock().entry(action.clone()).or_default() += 1;

    if queue.failing.load(Ordering::SeqCst) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
    }

    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    queue.requests.lock().push(request.clone());

    match action.as_str() {
        "SendMessage" => {
            let id = {
                let mut next = queue.next_id.lock();
                *next += 1;
                format!("msg-{next}")
            };
            let delay = request["DelaySeconds"].as_u64().unwrap_or(0);
            queue.messages.lock().push(FakeMessage {
                id: id.clone(),
                body: request["MessageBody"].as_str().unwrap_or_default().to_string(),
                visible_at: Instant::now() + Duration::from_secs(delay),
                receive_count: 0,
                receipt: None,
            });
            (StatusCode::OK, Json(json!({ "MessageId": id })))
        }
        "ReceiveMessage" => {
            let max = request["MaxNumberOfMessages"].as_u64().unwrap_or(1) as usize;
            let wait = request["WaitTimeSeconds"].as_u64().unwrap_or(0);
            let visibility = request["VisibilityTimeout"].as_u64().unwrap_or(30);
            let deadline = Instant::now() + Duration::from_secs(wait);

            loop {
                let messages = queue.receive(max, visibility);
                if !messages.is_empty() || Instant::now() >= deadline {
                    return (StatusCode::OK, Json(json!({ "Messages": messages })));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        "DeleteMessage" => {
            let receipt = request["ReceiptHandle"].as_str().unwrap_or_default();
            let mut messages = queue.messages.lock();
            let before = messages.len();
            messages.retain(|message| message.receipt.as_deref() != Some(receipt));
            if messages.len() < before {
                (StatusCode::OK, Json(json!({})))
            } else {
                api_error(StatusCode::BAD_REQUEST, "com.amazonaws.sqs#ReceiptHandleIsInvalid")
            }
        }
        "ChangeMessageVisibility" => {
            let receipt = request["ReceiptHandle"].as_str().unwrap_or_default();
            let secs = request["VisibilityTimeout"].as_u64().unwrap_or(0);
            let mut messages = queue.messages.lock();
            match messages
                .iter_mut()
                .find(|message| message.receipt.as_deref() == Some(receipt))
            {
                Some(message) => {
                    message.visible_at = Instant::now() + Duration::from_secs(secs);
                    (StatusCode::OK, Json(json!({})))
                }
                None => api_error(
                    StatusCode::BAD_REQUEST,
                    "AWS.SimpleQueueService.MessageNotInflight",
                ),
            }
        }
        "GetQueueAttributes" => {
            let now = Instant::now();
            let messages = queue.messages.lock();
            let visible = messages.iter().filter(|m| m.visible_at <= now).count();
            let delayed = messages
                .iter()
                .filter(|m| m.visible_at > now && m.receive_count == 0)
                .count();
            let in_flight = messages.len() - visible - delayed;
            (
                StatusCode::OK,
                Json(json!({ "Attributes": {
                    "ApproximateNumberOfMessages": visible.to_string(),
                    "ApproximateNumberOfMessagesNotVisible": in_flight.to_string(),
                    "ApproximateNumberOfMessagesDelayed": delayed.to_string()
                }})),
            )
        }
        _ => api_error(StatusCode::BAD_REQUEST, "InvalidAction"),
    }
}

struct FakeServer {
    endpoint: String,
    queue: Arc<FakeQueue>,
}

impl FakeServer {
    async fn start() -> Self {
        let queue = Arc::new(FakeQueue::default());
        let app = Router::new().route("/", post(handle)).with_state(queue.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { endpoint, queue }
    }

    fn config(&self) -> CloudQueueConfig {
        CloudQueueConfig {
            wait_time: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            ..CloudQueueConfig::new(self.endpoint.clone(), format!("{}queue/emails", self.endpoint))
        }
    }

    fn broker(&self, prefetch: usize) -> CloudQueueBroker {
        CloudQueueBroker::new("emails", self.config(), prefetch).unwrap()
    }
}

fn create_test_job(payload: &str) -> Job {
    Job::new(
        "emails",
        payload.to_string(),
        JobOptions {
            max_attempts: 3,
            ..JobOptions::default()
        },
    )
}

/// C1. Push, Reserve And Ack Round Trip Through The Service
#[tokio::test]
async fn test_push_reserve_ack() {
    let server = FakeServer::start().await;
    let broker = server.broker(1);

    // Arrange
    let job_id = broker.push(create_test_job("hello")).await.unwrap();
    assert_eq!(broker.stat().await.unwrap().queued, 1);

    // Act
    let reservation = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(broker.stat().await.unwrap().reserved, 1);
    broker.ack(&reservation).await.unwrap();

    // Assert
    assert_eq!(reservation.job.id, job_id);
    assert_eq!(reservation.job.payload, "hello");
    assert_eq!(reservation.job.attempt, 0);
    assert_eq!(broker.stat().await.unwrap().total(), 0);

    let requests = server.queue.requests.lock();
    assert!(requests
        .iter()
        .all(|request| request["QueueUrl"] == format!("{}queue/emails", server.endpoint)));
}

/// C2. Redeliveries Count Attempts From The Service Receive Counter
#[tokio::test]
async fn test_nack_redelivers_with_native_attempts() {
    let server = FakeServer::start().await;
    let broker = server.broker(1);

    // Arrange
    broker.push(create_test_job("retry me")).await.unwrap();
    let first = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();

    // Act: make it visible again right away
    broker.nack(&first, Duration::ZERO).await.unwrap();
    let second = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();

    // Assert
    assert_eq!(second.job.id, first.job.id);
    assert_ne!(second.token, first.token);
    assert_eq!(second.job.attempt, 1);
    assert!(broker.capabilities().native_attempts);
}

/// C3. Prefetched Messages Are Served From The Local Buffer
#[tokio::test]
async fn test_prefetch_buffers_batch() {
    let server = FakeServer::start().await;
    let broker = server.broker(5);

    // Arrange
    for i in 0..3 {
        broker.push(create_test_job(&format!("job-{i}"))).await.unwrap();
    }

    // Act
    let mut reserved = Vec::new();
    for _ in 0..3 {
        reserved.push(broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap());
    }

    // Assert: one round trip for the whole batch
    assert_eq!(server.queue.calls("ReceiveMessage"), 1);
    assert_eq!(reserved.len(), 3);
    let receive = server
        .queue
        .requests
        .lock()
        .iter()
        .find(|r| r.get("MaxNumberOfMessages").is_some())
        .cloned()
        .unwrap();
    assert_eq!(receive["MaxNumberOfMessages"], 5);
}

/// C4. Stale Receipts: Ack Ignored, Extend Reported
#[tokio::test]
async fn test_stale_receipts() {
    let server = FakeServer::start().await;
    let broker = server.broker(1);

    // Arrange
    broker.push(create_test_job("once")).await.unwrap();
    let reservation = broker.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
    broker.ack(&reservation).await.unwrap();

    // Act
    let again = broker.ack(&reservation).await;
    let extended = broker.extend(&reservation, Duration::from_secs(30)).await;

    // Assert
    assert!(again.is_ok());
    assert!(matches!(extended, Err(JobsError::Reservation(_))));
}

/// C5. Server Errors Map To Unavailability
#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = FakeServer::start().await;
    let broker = server.broker(1);

    // Arrange
    server.queue.failing.store(true, Ordering::SeqCst);

    // Act
    let pushed = broker.push(create_test_job("hello")).await;
    let reserved = broker.reserve(Duration::ZERO).await;

    // Assert
    let err = pushed.unwrap_err();
    assert!(matches!(err, JobsError::BrokerUnavailable(_)));
    assert!(err.is_transient());
    assert!(matches!(reserved, Err(JobsError::BrokerUnavailable(_))));
}

/// C6. Pipelines Configured With The Cloud Queue Process Jobs
#[tokio::test]
async fn test_pipeline_over_cloud_queue() {
    let server = FakeServer::start().await;
    let registry = Arc::new(PipelineRegistry::new());
    let config: PipelineConfig = serde_json::from_value(json!({
        "broker": "sqs",
        "connection": {
            "endpoint": server.endpoint,
            "queue_url": format!("{}queue/emails", server.endpoint),
            "wait_time": "1s",
            "request_timeout": "5s"
        },
        "max_attempts": 2,
        "reserve_timeout": "1s"
    }))
    .unwrap();
    registry.register("emails", &config).await.unwrap();

    let queue = JobQueue::new(registry);
    let mut events = queue.events();
    let seen = Arc::new(Mutex::new(Vec::new()));

    // Arrange: fail once, then succeed
    let attempts = seen.clone();
    queue
        .consume("emails", move |job: Job| {
            attempts.lock().push(job.attempt);
            async move {
                if job.attempt == 0 {
                    Outcome::retry_after(Duration::ZERO)
                } else {
                    Outcome::Ack
                }
            }
        })
        .await
        .unwrap();

    // Act
    queue.push("emails", "hello", PushOptions::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(JobEvent::Acked { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("Timeout waiting for ack");

    // Assert
    assert_eq!(*seen.lock(), vec![0, 1]);
    queue.stop().await;
    assert!(server.queue.messages.lock().is_empty());
}
