//! JSON envelope used by network brokers to carry a job across the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{Job, JobId, JobOptions};
use crate::{JobsError, JobsResult};

#[derive(Debug, Serialize, Deserialize)]
struct JobEnvelope {
    id: JobId,
    pipeline: String,
    payload: String,
    options: JobOptions,
    #[serde(default)]
    attempt: u32,
}

/// Serialize a job; the payload travels base64-encoded
pub fn encode(job: &Job) -> JobsResult<Vec<u8>> {
    let envelope = JobEnvelope {
        id: job.id.clone(),
        pipeline: job.pipeline.clone(),
        payload: STANDARD.encode(&job.payload),
        options: job.options.clone(),
        attempt: job.attempt,
    };

    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode(bytes: &[u8]) -> JobsResult<Job> {
    let envelope: JobEnvelope = serde_json::from_slice(bytes)?;
    let payload = STANDARD
        .decode(envelope.payload.as_bytes())
        .map_err(|e| JobsError::Serialization(format!("invalid payload encoding: {e}")))?;

    Ok(Job {
        id: envelope.id,
        pipeline: envelope.pipeline,
        payload: Bytes::from(payload),
        options: envelope.options,
        attempt: envelope.attempt,
    })
}
