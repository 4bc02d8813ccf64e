use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job, assigned when the job is pushed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Broker-issued handle of one delivery.
///
/// Local brokers mint a UUID, the reservation protocol uses the server job
/// id and the cloud queue uses the receipt handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationToken(pub String);

impl ReservationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReservationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReservationToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for ReservationToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_ne!(ReservationToken::new(), ReservationToken::new());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = JobId::from("job-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"job-1\"");
        assert_eq!(id.to_string(), "job-1");
    }
}
