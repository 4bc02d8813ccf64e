use serde::{Deserialize, Serialize};

/// Broker capabilities - explicit feature detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCapabilities {
    /// Honors push delays and retry delays
    pub delayed: bool,

    /// Reservations can be extended while a handler runs (heartbeat)
    pub lease_extend: bool,

    /// The transport counts deliveries itself, including visibility expiries
    pub native_attempts: bool,

    /// Zero-delay jobs are delivered in push order
    pub ordered: bool,
}

impl Default for BrokerCapabilities {
    fn default() -> Self {
        Self {
            delayed: true,
            lease_extend: false,
            native_attempts: false,
            ordered: false,
        }
    }
}

impl BrokerCapabilities {
    /// Check if a specific feature is supported
    pub fn supports(&self, feature: &str) -> bool {
        match feature {
            "delayed" => self.delayed,
            "lease_extend" => self.lease_extend,
            "native_attempts" => self.native_attempts,
            "ordered" => self.ordered,
            _ => false,
        }
    }

    pub fn supported_features(&self) -> Vec<&'static str> {
        let mut features = Vec::new();

        if self.delayed { features.push("delayed"); }
        if self.lease_extend { features.push("lease_extend"); }
        if self.native_attempts { features.push("native_attempts"); }
        if self.ordered { features.push("ordered"); }

        features
    }
}
