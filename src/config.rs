//! Link configuration
//!
//! Tunables shared by a link and every circuit and stream it carries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Link`](crate::Link) and everything multiplexed on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Capacity of every cell and data mailbox
    pub mailbox_capacity: usize,

    /// How long to wait for CREATED_FAST after sending CREATE_FAST
    #[serde(with = "as_secs")]
    pub handshake_timeout: Duration,

    /// How long to wait for CONNECTED after BEGIN_DIR or BEGIN
    #[serde(with = "as_secs")]
    pub stream_open_timeout: Duration,

    /// How long a circuit or stream may sit on an exhausted send window
    #[serde(with = "as_secs")]
    pub window_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 32,
            handshake_timeout: Duration::from_secs(30),
            stream_open_timeout: Duration::from_secs(30),
            window_timeout: Duration::from_secs(120),
        }
    }
}

impl LinkConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::TorError::Parse(e.to_string()))
    }
}

mod as_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.mailbox_capacity, 32);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_json() {
        let config = LinkConfig::from_json(r#"{"handshake_timeout": 5}"#).unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.window_timeout, Duration::from_secs(120));
        assert_eq!(config.mailbox_capacity, 32);
    }

    #[test]
    fn test_bad_json() {
        assert!(LinkConfig::from_json("{\"mailbox_capacity\": \"many\"}").is_err());
    }
}
