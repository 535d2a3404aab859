use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome classification shared by reads, MQTT payloads and history rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Timeout,
    CrcError,
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    PortBusy,
    ConfigError,
    UnknownError,
    /// Synthetic heartbeat status for a node or parameter that stopped answering.
    Silent,
}

impl StatusCode {
    /// Numeric code carried in payloads and history rows.
    pub fn code(&self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Timeout => 1,
            StatusCode::CrcError => 2,
            StatusCode::IllegalFunction => 3,
            StatusCode::IllegalDataAddress => 4,
            StatusCode::IllegalDataValue => 5,
            StatusCode::SlaveDeviceFailure => 6,
            StatusCode::PortBusy => 7,
            StatusCode::ConfigError => 10,
            StatusCode::UnknownError => 12,
            StatusCode::Silent => 20,
        }
    }

    /// Short uppercase name, used as the default status message.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::CrcError => "CRC_ERROR",
            StatusCode::IllegalFunction => "ILLEGAL_FUNCTION",
            StatusCode::IllegalDataAddress => "ILLEGAL_DATA_ADDRESS",
            StatusCode::IllegalDataValue => "ILLEGAL_DATA_VALUE",
            StatusCode::SlaveDeviceFailure => "SLAVE_DEVICE_FAILURE",
            StatusCode::PortBusy => "PORT_BUSY",
            StatusCode::ConfigError => "CONFIG_ERROR",
            StatusCode::UnknownError => "UNKNOWN_ERROR",
            StatusCode::Silent => "SILENT",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message published on the broker for one parameter.
///
/// Carries the value and its status only; the read context (line, unit,
/// address) is kept for the history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttPayload {
    /// Stringified engineering value, `None` when there is no data.
    pub value: Option<String>,
    pub metadata: PayloadMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub timestamp: String,
    pub status_code: StatusDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDetail {
    pub code: i32,
    pub message: String,
    pub silent_for_s: u64,
    /// Display text of an active discrete alarm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<String>,
}

impl MqttPayload {
    /// Create a payload stamped with the current time.
    pub fn new(
        value: Option<String>,
        status: StatusCode,
        message: impl Into<String>,
        silent_for_s: u64,
    ) -> Self {
        Self::at(current_timestamp_millis(), value, status, message, silent_for_s)
    }

    /// Create a payload stamped with `timestamp_ms`.
    pub fn at(
        timestamp_ms: i64,
        value: Option<String>,
        status: StatusCode,
        message: impl Into<String>,
        silent_for_s: u64,
    ) -> Self {
        Self {
            value,
            metadata: PayloadMetadata {
                timestamp: iso_timestamp_millis(timestamp_ms),
                status_code: StatusDetail {
                    code: status.code(),
                    message: message.into(),
                    silent_for_s,
                    alarm: None,
                },
            },
        }
    }

    /// Attach an alarm display text.
    pub fn with_alarm(mut self, alarm: Option<String>) -> Self {
        self.metadata.status_code.alarm = alarm;
        self
    }
}

/// One row of the telemetry history.
///
/// Written once per accepted publish or heartbeat and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Absolute MQTT topic the event was published on.
    pub topic: String,
    pub object: String,
    pub param: String,
    pub line: String,
    pub unit_id: u8,
    pub register_type: String,
    pub address: u16,
    /// Stringified value; `None` for failed reads and heartbeats.
    pub value: Option<String>,
    pub code: i32,
    pub message: String,
    pub silent_for_s: u64,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch (should never happen in practice).
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Format epoch milliseconds as `2024-01-01T00:00:00.000Z`.
pub fn iso_timestamp_millis(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Ok.code(), 0);
        assert_eq!(StatusCode::Timeout.code(), 1);
        assert_eq!(StatusCode::PortBusy.code(), 7);
        assert_eq!(StatusCode::UnknownError.code(), 12);
        assert_eq!(StatusCode::Silent.code(), 20);
        assert_eq!(StatusCode::CrcError.to_string(), "CRC_ERROR");
        assert!(StatusCode::Ok.is_ok());
        assert!(!StatusCode::Silent.is_ok());
    }

    #[test]
    fn test_iso_timestamp() {
        assert_eq!(iso_timestamp_millis(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            iso_timestamp_millis(1_700_000_000_123),
            "2023-11-14T22:13:20.123Z"
        );
    }

    #[test]
    fn test_payload_with_alarm() {
        let payload = MqttPayload::at(0, Some("1".to_string()), StatusCode::Ok, "OK", 0)
            .with_alarm(Some("Pump fault".to_string()));

        assert_eq!(payload.metadata.timestamp, "1970-01-01T00:00:00.000Z");
        assert_eq!(
            payload.metadata.status_code.alarm.as_deref(),
            Some("Pump fault")
        );
    }
}
