//! Retained bridge status on `{base_topic}/@/status`.

use rtugate_common::{current_timestamp_millis, iso_timestamp_millis};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::publisher::Publisher;

/// Lifecycle state carried in the status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Running,
    /// Also the broker-side last will.
    Offline,
}

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "modbus").
    pub bridge: String,
    pub version: String,
    pub status: BridgeState,
    /// ISO-8601 UTC time the status was produced.
    pub since: String,
    /// Bridge-specific fields, flattened into the message.
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    pub fn new(bridge: impl Into<String>, version: impl Into<String>, status: BridgeState) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status,
            since: iso_timestamp_millis(current_timestamp_millis()),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(bridge, version, BridgeState::Running)
    }

    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(bridge, version, BridgeState::Offline)
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Queue this status as a retained QoS 1 message.
    pub fn publish(&self, publisher: &Publisher) -> Result<()> {
        let topic = publisher.topics().status_topic();
        publisher.publish_json_retained(&topic, self)
    }
}

/// Publishes the status of one named bridge on startup and shutdown.
pub struct StatusPublisher {
    publisher: Publisher,
    bridge_name: String,
    version: String,
}

impl StatusPublisher {
    pub fn new(
        publisher: Publisher,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            bridge_name: bridge_name.into(),
            version: version.into(),
        }
    }

    pub fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let status = BridgeStatus::running(&self.bridge_name, &self.version);
        let status = match metadata {
            Some(meta) => status.with_metadata(meta),
            None => status,
        };
        status.publish(&self.publisher)
    }

    pub fn publish_offline(&self) -> Result<()> {
        BridgeStatus::offline(&self.bridge_name, &self.version).publish(&self.publisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_running() {
        let status = BridgeStatus::running("modbus", "0.2.0");
        assert_eq!(status.bridge, "modbus");
        assert_eq!(status.status, BridgeState::Running);
        assert!(status.since.ends_with('Z'));
    }

    #[test]
    fn test_metadata_is_flattened() {
        let status = BridgeStatus::running("modbus", "0.2.0").with_metadata(serde_json::json!({
            "lines": ["rs485-1", "rs485-2"],
        }));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["lines"][1], "rs485-2");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_offline_serialization() {
        let json = serde_json::to_value(BridgeStatus::offline("modbus", "0.2.0")).unwrap();
        assert_eq!(json["bridge"], "modbus");
        assert_eq!(json["status"], "offline");
    }
}
