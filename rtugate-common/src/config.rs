use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::serialization::Format;
use crate::topic::normalize_base_topic;

/// MQTT broker connection and publish settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional username for broker authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for broker authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Quality of service for published telemetry (0, 1 or 2).
    #[serde(default)]
    pub qos: u8,

    /// Retain flag for published telemetry.
    #[serde(default)]
    pub retain: bool,

    /// Prefix for relative topics.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_s: u64,

    /// Payload encoding.
    #[serde(default)]
    pub payload_format: Format,

    /// Capacity of the outgoing request queue of the MQTT client.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "rtugate".to_string()
}

fn default_base_topic() -> String {
    "/devices".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            qos: 0,
            retain: false,
            base_topic: default_base_topic(),
            keep_alive_s: default_keep_alive(),
            payload_format: Format::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl MqttConfig {
    /// Base topic with a leading `/` and without a trailing one.
    pub fn base(&self) -> String {
        normalize_base_topic(&self.base_topic)
    }

    /// Check broker settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("mqtt.port must be 1-65535".to_string()));
        }
        if self.qos > 2 {
            return Err(Error::Config(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.qos
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(
                "mqtt.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sections {
        #[serde(default)]
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_parse_mqtt_section() {
        let json5 = r#"
        {
            mqtt: {
                host: "broker.local",
                qos: 1,
                retain: true,
                base_topic: "plant/",
                payload_format: "cbor",
            },
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: Sections = parse_config(json5).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, 1);
        assert!(config.mqtt.retain);
        assert_eq!(config.mqtt.base(), "/plant");
        assert_eq!(config.mqtt.payload_format, Format::Cbor);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_default_config() {
        let config: Sections = parse_config("{}").unwrap();

        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, 0);
        assert!(!config.mqtt.retain);
        assert_eq!(config.mqtt.base_topic, "/devices");
        assert_eq!(config.mqtt.payload_format, Format::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_json_logging_format() {
        let json5 = r#"{ logging: { level: "debug", format: "json" } }"#;
        let config: Sections = parse_config(json5).unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_mqtt_validation() {
        let mut mqtt = MqttConfig::default();
        assert!(mqtt.validate().is_ok());

        mqtt.qos = 3;
        assert!(mqtt.validate().is_err());

        mqtt.qos = 0;
        mqtt.host = "  ".to_string();
        assert!(mqtt.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<Sections> = load_config("/nonexistent/rtugate.json5");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
