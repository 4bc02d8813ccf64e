//! Request and response bodies of the queue's JSON API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub(crate) const RECEIVE_COUNT: &str = "ApproximateReceiveCount";
pub(crate) const VISIBLE: &str = "ApproximateNumberOfMessages";
pub(crate) const NOT_VISIBLE: &str = "ApproximateNumberOfMessagesNotVisible";
pub(crate) const DELAYED: &str = "ApproximateNumberOfMessagesDelayed";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SendMessage<'a> {
    pub queue_url: &'a str,
    pub message_body: &'a str,
    pub delay_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SendMessageResult {
    #[serde(default)]
    pub message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ReceiveMessage<'a> {
    pub queue_url: &'a str,
    pub max_number_of_messages: usize,
    pub wait_time_seconds: u64,
    pub visibility_timeout: u64,
    pub attribute_names: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ReceiveMessageResult {
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Message {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Message {
    /// Deliveries before this one, as counted by the queue
    pub(crate) fn previous_deliveries(&self) -> u32 {
        self.attributes
            .get(RECEIVE_COUNT)
            .and_then(|count| count.parse::<u32>().ok())
            .map(|count| count.saturating_sub(1))
            .unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DeleteMessage<'a> {
    pub queue_url: &'a str,
    pub receipt_handle: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ChangeMessageVisibility<'a> {
    pub queue_url: &'a str,
    pub receipt_handle: &'a str,
    pub visibility_timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct GetQueueAttributes<'a> {
    pub queue_url: &'a str,
    pub attribute_names: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct GetQueueAttributesResult {
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl GetQueueAttributesResult {
    pub(crate) fn count(&self, name: &str) -> u64 {
        self.attributes
            .get(name)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

/// Error body returned with non-2xx statuses
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiError {
    #[serde(rename = "__type", default)]
    pub kind: String,
    #[serde(alias = "Message", default)]
    pub message: String,
}
