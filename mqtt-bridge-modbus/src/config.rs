//! Configuration for the Modbus RTU gateway.

use std::collections::HashSet;
use std::time::Duration;

use rtugate_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig, MqttConfig};
use rtugate_common::default_param_topic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerts::AlertsConfig;

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Validation(msg.into())
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Diagnostics switches
    #[serde(default)]
    pub debug: DebugConfig,

    /// Register address conventions
    #[serde(default)]
    pub addressing: AddressingConfig,

    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// History database
    #[serde(default)]
    pub db: DbConfig,

    /// Poll cadence and fault handling
    #[serde(default)]
    pub polling: PollingConfig,

    /// Block reads
    #[serde(default)]
    pub batch_read: BatchConfig,

    /// Silence detection
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Serial lines to poll
    #[serde(default)]
    pub lines: Vec<LineConfig>,

    /// Grouped alert notifications
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Diagnostics; nothing here changes what is published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Master switch for the options below.
    #[serde(default)]
    pub enabled: bool,

    /// Log every successful read at debug level.
    #[serde(default)]
    pub log_reads: bool,

    /// Period of the per-line summary log, 0 disables it.
    #[serde(default)]
    pub summary_every_s: u64,
}

impl DebugConfig {
    /// Per-read debug events are wanted.
    pub fn log_reads(&self) -> bool {
        self.enabled && self.log_reads
    }

    /// Period of the per-line summary, if enabled.
    pub fn summary_every(&self) -> Option<Duration> {
        (self.enabled && self.summary_every_s > 0)
            .then(|| Duration::from_secs(self.summary_every_s))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressingConfig {
    /// Convert 40001/30001-style and 1-based addresses to 0-based wire addresses.
    #[serde(default)]
    pub normalize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    /// sqlx connection URL, e.g. `sqlite://data/history.db`.
    #[serde(default = "default_db_url")]
    pub url: String,

    #[serde(default)]
    pub history: HistoryConfig,
}

fn default_db_url() -> String {
    "sqlite://data/history.db".to_string()
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            history: HistoryConfig::default(),
        }
    }
}

/// History rotation settings. Zero disables the matching limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub max_rows: u64,

    #[serde(default)]
    pub ttl_days: u64,

    /// Inserts between two rotation passes.
    #[serde(default = "default_cleanup_every")]
    pub cleanup_every: u64,

    /// Capacity of the queue between the poll loops and the writer task.
    #[serde(default = "default_history_queue")]
    pub queue_capacity: usize,
}

fn default_cleanup_every() -> u64 {
    500
}

fn default_history_queue() -> usize {
    4096
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_rows: 0,
            ttl_days: 0,
            cleanup_every: default_cleanup_every(),
            queue_capacity: default_history_queue(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Target cycle period in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Upper bound of the random delay added to each cycle
    #[serde(default)]
    pub jitter_ms: u64,

    /// Consecutive failed cycles before a node is skipped (0 disables)
    #[serde(default = "default_max_errors")]
    pub max_errors_before_backoff: u32,

    /// How long a node is skipped once the threshold is reached
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Delay before reopening a serial port that failed to open
    #[serde(default = "default_port_retry_backoff_s")]
    pub port_retry_backoff_s: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_errors() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_port_retry_backoff_s() -> u64 {
    5
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            jitter_ms: 0,
            max_errors_before_backoff: default_max_errors(),
            backoff_ms: default_backoff_ms(),
            port_retry_backoff_s: default_port_retry_backoff_s(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Largest coil/discrete span per request
    #[serde(default = "default_max_bits")]
    pub max_bits: u16,

    /// Largest holding/input span per request
    #[serde(default = "default_max_registers")]
    pub max_registers: u16,

    /// Unused addresses tolerated between two parameters of one request
    #[serde(default)]
    pub max_gap: u16,
}

fn default_max_bits() -> u16 {
    1968
}

fn default_max_registers() -> u16 {
    120
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bits: default_max_bits(),
            max_registers: default_max_registers(),
            max_gap: 0,
        }
    }
}

/// Granularity of silence tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatScope {
    /// Each parameter has its own silence timer.
    #[default]
    Param,
    /// One timer per node; all of its parameters go silent together.
    Node,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub scope: HeartbeatScope,

    /// Silence before the first heartbeat (0 = polling interval + jitter)
    #[serde(default)]
    pub silence_after_ms: u64,

    /// Period between repeated heartbeats (0 = silence threshold)
    #[serde(default)]
    pub repeat_ms: u64,
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "none")]
    None,
    #[serde(rename = "E", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

/// One RS-485 line and the nodes on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineConfig {
    /// Line name (unique, used in logs and history rows)
    pub name: String,

    /// Serial device path (e.g., "/dev/ttyUSB0" or "COM1")
    pub device: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Transaction timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default = "default_stopbits")]
    pub stopbits: u8,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Overrides `polling.port_retry_backoff_s` for this line
    #[serde(default)]
    pub port_retry_backoff_s: Option<u64>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

fn default_baudrate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_stopbits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

impl LineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A Modbus slave on a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Modbus unit/slave ID (1-247)
    pub unit_id: u8,

    /// Logical object name, first segment of default topics
    pub object: String,

    /// External numeric id of the object
    #[serde(default)]
    pub num_object: Option<u32>,

    #[serde(default)]
    pub params: Vec<ParamConfig>,
}

/// Modbus register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    /// Discrete output coils (read/write, 1-bit)
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    Discrete,
    /// Holding registers (read/write, 16-bit)
    Holding,
    /// Input registers (read-only, 16-bit)
    Input,
}

impl RegisterType {
    /// Return the string name for this register type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
        }
    }

    /// Single-bit register types.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }
}

/// Parameter access mode. Writes are never issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    R,
    Rw,
}

/// When a successful read is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    #[default]
    OnChange,
    Interval,
    #[serde(alias = "both")]
    OnChangeAndInterval,
}

/// One published value of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamConfig {
    /// Name (unique within the node)
    pub name: String,

    pub register_type: RegisterType,

    /// Configured address, see [`AddressingConfig`]
    pub address: u32,

    /// Divisor applied to the raw value
    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub mode: AccessMode,

    #[serde(default)]
    pub publish_mode: PublishMode,

    #[serde(default)]
    pub publish_interval_ms: u64,

    /// Relative or absolute topic (default: `{object}/controls/{name}`)
    #[serde(default)]
    pub topic: Option<String>,

    /// Raw value signalling an alarm on coil/discrete parameters
    #[serde(default)]
    pub error_state: Option<u8>,

    /// Alarm text shown when `error_state` matches
    #[serde(default)]
    pub display_error_text: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

impl ParamConfig {
    /// Configured topic or the `{object}/controls/{name}` default.
    pub fn topic_for(&self, object: &str) -> String {
        match self.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => topic.to_string(),
            _ => default_param_topic(object, &self.name),
        }
    }

    /// Wire address after optional normalization of documentation-style addresses.
    pub fn effective_address(&self, normalize: bool) -> u32 {
        let a = self.address;
        if !normalize {
            return a;
        }
        match self.register_type {
            RegisterType::Holding if a >= 40001 => a - 40001,
            RegisterType::Input if a >= 30001 => a - 30001,
            RegisterType::Coil | RegisterType::Discrete if (1..100_000).contains(&a) => a - 1,
            _ => a,
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    /// Alarm text when `raw` equals the configured error state.
    pub fn alarm_for(&self, raw: u16) -> Option<String> {
        let state = self.error_state?;
        if !self.register_type.is_bit() || u16::from(state) != raw {
            return None;
        }
        Some(
            self.display_error_text
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("{} alarm", self.name)),
        )
    }
}

/// Identity of a parameter across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    pub line: String,
    pub unit_id: u8,
    pub param: String,
}

impl ParamKey {
    pub fn new(line: impl Into<String>, unit_id: u8, param: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            unit_id,
            param: param.into(),
        }
    }
}

/// Everything a line scheduler depends on.
///
/// Two equal settings values mean a running line can be left alone on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSettings {
    pub line: LineConfig,
    pub polling: PollingConfig,
    pub batch: BatchConfig,
    pub heartbeat: HeartbeatConfig,
    pub addressing: AddressingConfig,
    pub debug: DebugConfig,
}

impl LineSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    pub fn node_backoff(&self) -> Duration {
        Duration::from_millis(self.polling.backoff_ms)
    }

    /// Per-line override, else the global port retry delay.
    pub fn port_retry_backoff(&self) -> Duration {
        Duration::from_secs(
            self.line
                .port_retry_backoff_s
                .unwrap_or(self.polling.port_retry_backoff_s),
        )
    }

    /// Silence threshold; 0 means the expected cycle cadence.
    pub fn silence_after(&self) -> Duration {
        match self.heartbeat.silence_after_ms {
            0 => Duration::from_millis(
                self.polling.interval_ms.saturating_add(self.polling.jitter_ms),
            ),
            ms => Duration::from_millis(ms),
        }
    }

    /// Heartbeat repeat period; 0 means the silence threshold.
    pub fn heartbeat_repeat(&self) -> Duration {
        match self.heartbeat.repeat_ms {
            0 => self.silence_after(),
            ms => Duration::from_millis(ms),
        }
    }
}

impl GatewayConfig {
    /// Effective settings of every line, in configuration order.
    pub fn line_settings(&self) -> Vec<LineSettings> {
        self.lines
            .iter()
            .map(|line| LineSettings {
                line: line.clone(),
                polling: self.polling.clone(),
                batch: self.batch_read.clone(),
                heartbeat: self.heartbeat.clone(),
                addressing: self.addressing.clone(),
                debug: self.debug.clone(),
            })
            .collect()
    }

    /// Keys of all configured parameters.
    pub fn param_keys(&self) -> HashSet<ParamKey> {
        self.lines
            .iter()
            .flat_map(|line| {
                line.nodes.iter().flat_map(move |node| {
                    node.params
                        .iter()
                        .map(move |p| ParamKey::new(&line.name, node.unit_id, &p.name))
                })
            })
            .collect()
    }

    /// Validate the configuration.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.mqtt
            .validate()
            .map_err(|e| ConfigError::invalid(e.to_string()))?;

        if self.db.url.trim().is_empty() {
            return Err(ConfigError::invalid("db.url must not be empty"));
        }
        if self.db.history.cleanup_every == 0 {
            return Err(ConfigError::invalid(
                "db.history.cleanup_every must be at least 1",
            ));
        }
        if self.db.history.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "db.history.queue_capacity must be at least 1",
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError::invalid("polling.interval_ms must be at least 1"));
        }
        if !(1..=2000).contains(&self.batch_read.max_bits) {
            return Err(ConfigError::invalid("batch_read.max_bits must be 1-2000"));
        }
        if !(1..=125).contains(&self.batch_read.max_registers) {
            return Err(ConfigError::invalid("batch_read.max_registers must be 1-125"));
        }

        let mut line_names = HashSet::new();
        for line in &self.lines {
            self.check_line(line)?;
            if !line_names.insert(line.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "Duplicate line name '{}'",
                    line.name
                )));
            }
        }

        self.alerts.check()
    }

    fn check_line(&self, line: &LineConfig) -> Result<(), ConfigError> {
        if line.name.trim().is_empty() {
            return Err(ConfigError::invalid("Line name cannot be empty"));
        }
        if line.device.trim().is_empty() {
            return Err(ConfigError::invalid(format!(
                "Line '{}': device cannot be empty",
                line.name
            )));
        }
        if line.baudrate == 0 {
            return Err(ConfigError::invalid(format!(
                "Line '{}': baudrate must be positive",
                line.name
            )));
        }
        if !(1..=2).contains(&line.stopbits) {
            return Err(ConfigError::invalid(format!(
                "Line '{}': stopbits must be 1 or 2",
                line.name
            )));
        }
        if !(5..=8).contains(&line.data_bits) {
            return Err(ConfigError::invalid(format!(
                "Line '{}': data_bits must be 5-8",
                line.name
            )));
        }

        let mut unit_ids = HashSet::new();
        for node in &line.nodes {
            if !(1..=247).contains(&node.unit_id) {
                return Err(ConfigError::invalid(format!(
                    "Line '{}': unit_id {} must be 1-247",
                    line.name, node.unit_id
                )));
            }
            if !unit_ids.insert(node.unit_id) {
                return Err(ConfigError::invalid(format!(
                    "Line '{}': duplicate unit_id {}",
                    line.name, node.unit_id
                )));
            }
            if node.object.trim().is_empty() {
                return Err(ConfigError::invalid(format!(
                    "Line '{}', unit {}: object cannot be empty",
                    line.name, node.unit_id
                )));
            }
            if node.params.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "Line '{}', unit {}: at least one param is required",
                    line.name, node.unit_id
                )));
            }

            let mut names = HashSet::new();
            for param in &node.params {
                self.check_param(line, node, param)?;
                if !names.insert(param.name.as_str()) {
                    return Err(ConfigError::invalid(format!(
                        "Line '{}', unit {}: duplicate param '{}'",
                        line.name, node.unit_id, param.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_param(
        &self,
        line: &LineConfig,
        node: &NodeConfig,
        param: &ParamConfig,
    ) -> Result<(), ConfigError> {
        let ctx = format!("Line '{}', unit {}", line.name, node.unit_id);

        if param.name.trim().is_empty() {
            return Err(ConfigError::invalid(format!(
                "{}: param name cannot be empty",
                ctx
            )));
        }
        if !param.scale.is_finite() || param.scale <= 0.0 {
            return Err(ConfigError::invalid(format!(
                "{}, param '{}': scale must be a positive number",
                ctx, param.name
            )));
        }
        if param.effective_address(self.addressing.normalize) > u32::from(u16::MAX) {
            return Err(ConfigError::invalid(format!(
                "{}, param '{}': address {} is out of range",
                ctx, param.name, param.address
            )));
        }
        if let Some(state) = param.error_state {
            if state > 1 {
                return Err(ConfigError::invalid(format!(
                    "{}, param '{}': error_state must be 0 or 1",
                    ctx, param.name
                )));
            }
            if !param.register_type.is_bit() {
                return Err(ConfigError::invalid(format!(
                    "{}, param '{}': error_state is only allowed on coil/discrete",
                    ctx, param.name
                )));
            }
        }
        if let Some(ref topic) = param.topic {
            rtugate_common::topic::validate_publish_topic(topic).map_err(|e| {
                ConfigError::invalid(format!("{}, param '{}': {}", ctx, param.name, e))
            })?;
        }

        Ok(())
    }
}

impl BridgeConfig for GatewayConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<(), BridgeError> {
        self.check().map_err(|e| BridgeError::validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        mqtt: { host: "broker.local", base_topic: "/plant" },
        db: { url: "sqlite::memory:", history: { max_rows: 1000 } },
        polling: { interval_ms: 500, jitter_ms: 100 },
        batch_read: { enabled: true },
        lines: [
            {
                name: "line1",
                device: "/dev/ttyUSB0",
                baudrate: 19200,
                parity: "E",
                nodes: [
                    {
                        unit_id: 1,
                        object: "boiler",
                        num_object: 3,
                        params: [
                            { name: "temp", register_type: "holding", address: 10, scale: 10, topic: "boiler/temp" },
                            { name: "pump_fault", register_type: "discrete", address: 0,
                              error_state: 1, display_error_text: "Pump fault" },
                        ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_json5(SAMPLE).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.polling.max_errors_before_backoff, 5);
        assert!(config.batch_read.enabled);
        assert_eq!(config.batch_read.max_registers, 120);
        assert_eq!(config.db.history.cleanup_every, 500);

        let line = &config.lines[0];
        assert_eq!(line.parity, Parity::Even);
        assert_eq!(line.stopbits, 1);
        assert_eq!(line.timeout(), Duration::from_millis(1000));

        let temp = &line.nodes[0].params[0];
        assert_eq!(temp.register_type, RegisterType::Holding);
        assert_eq!(temp.publish_mode, PublishMode::OnChange);
        assert_eq!(temp.mode, AccessMode::R);
        assert_eq!(temp.scale, 10.0);
    }

    #[test]
    fn test_default_topic() {
        let config = GatewayConfig::from_json5(SAMPLE).unwrap();
        let node = &config.lines[0].nodes[0];

        assert_eq!(node.params[0].topic_for(&node.object), "boiler/temp");
        assert_eq!(
            node.params[1].topic_for(&node.object),
            "boiler/controls/pump_fault"
        );
    }

    #[test]
    fn test_alarm_text() {
        let config = GatewayConfig::from_json5(SAMPLE).unwrap();
        let fault = &config.lines[0].nodes[0].params[1];

        assert_eq!(fault.alarm_for(1).as_deref(), Some("Pump fault"));
        assert_eq!(fault.alarm_for(0), None);
    }

    #[test]
    fn test_parity_aliases() {
        let line: LineConfig =
            json5::from_str(r#"{ name: "l", device: "COM1", parity: "odd" }"#).unwrap();
        assert_eq!(line.parity, Parity::Odd);
        assert!(json5::from_str::<LineConfig>(r#"{ name: "l", device: "COM1", parity: "X" }"#).is_err());
    }

    #[test]
    fn test_publish_mode_names() {
        let p: ParamConfig = json5::from_str(
            r#"{ name: "a", register_type: "input", address: 1, publish_mode: "on_change_and_interval" }"#,
        )
        .unwrap();
        assert_eq!(p.publish_mode, PublishMode::OnChangeAndInterval);

        let p: ParamConfig = json5::from_str(
            r#"{ name: "a", register_type: "input", address: 1, publish_mode: "interval", publish_interval_ms: 5000 }"#,
        )
        .unwrap();
        assert_eq!(p.publish_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_address_normalization() {
        let mut p: ParamConfig =
            json5::from_str(r#"{ name: "a", register_type: "holding", address: 40011 }"#).unwrap();
        assert_eq!(p.effective_address(false), 40011);
        assert_eq!(p.effective_address(true), 10);

        p.register_type = RegisterType::Input;
        p.address = 30001;
        assert_eq!(p.effective_address(true), 0);

        p.register_type = RegisterType::Coil;
        p.address = 1;
        assert_eq!(p.effective_address(true), 0);

        p.register_type = RegisterType::Holding;
        p.address = 5;
        assert_eq!(p.effective_address(true), 5);
    }

    #[test]
    fn test_line_settings_derived_durations() {
        let mut config = GatewayConfig::from_json5(SAMPLE).unwrap();
        let settings = &config.line_settings()[0];

        assert_eq!(settings.port_retry_backoff(), Duration::from_secs(5));
        assert_eq!(settings.silence_after(), Duration::from_millis(600));
        assert_eq!(settings.heartbeat_repeat(), Duration::from_millis(600));

        config.lines[0].port_retry_backoff_s = Some(1);
        config.heartbeat.repeat_ms = 2000;
        let settings = &config.line_settings()[0];
        assert_eq!(settings.port_retry_backoff(), Duration::from_secs(1));
        assert_eq!(settings.heartbeat_repeat(), Duration::from_secs(2));
    }

    #[test]
    fn test_param_keys() {
        let config = GatewayConfig::from_json5(SAMPLE).unwrap();
        let keys = config.param_keys();

        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&ParamKey::new("line1", 1, "temp")));
    }

    #[test]
    fn test_validation_rules() {
        let base = GatewayConfig::from_json5(SAMPLE).unwrap();
        assert!(base.check().is_ok());

        let mut c = base.clone();
        c.lines.push(c.lines[0].clone());
        assert!(c.check().is_err(), "duplicate line name");

        let mut c = base.clone();
        let node = c.lines[0].nodes[0].clone();
        c.lines[0].nodes.push(node);
        assert!(c.check().is_err(), "duplicate unit id");

        let mut c = base.clone();
        c.lines[0].nodes[0].unit_id = 0;
        assert!(c.check().is_err(), "unit id 0");

        let mut c = base.clone();
        c.lines[0].nodes[0].params[0].scale = 0.0;
        assert!(c.check().is_err(), "zero scale");

        let mut c = base.clone();
        c.lines[0].nodes[0].params[0].error_state = Some(1);
        assert!(c.check().is_err(), "error_state on holding");

        let mut c = base.clone();
        c.lines[0].nodes[0].params[1].error_state = Some(2);
        assert!(c.check().is_err(), "error_state out of range");

        let mut c = base.clone();
        c.lines[0].stopbits = 3;
        assert!(c.check().is_err(), "stopbits");

        let mut c = base.clone();
        c.batch_read.max_registers = 126;
        assert!(c.check().is_err(), "max_registers");

        let mut c = base.clone();
        c.polling.interval_ms = 0;
        assert!(c.check().is_err(), "interval");

        let mut c = base.clone();
        c.db.history.cleanup_every = 0;
        assert!(c.check().is_err(), "cleanup_every");

        let mut c = base.clone();
        c.lines[0].nodes[0].params[0].topic = Some("boiler/+/temp".to_string());
        assert!(c.check().is_err(), "wildcard topic");

        let mut c = base.clone();
        c.lines[0].nodes[0].params.clear();
        assert!(c.check().is_err(), "node without params");

        let mut c = base;
        c.lines[0].nodes[0].params[0].address = 70000;
        assert!(c.check().is_err(), "address range");
    }

    #[test]
    fn test_silence_threshold_saturates() {
        let mut config = GatewayConfig::from_json5(SAMPLE).unwrap();
        config.polling.interval_ms = u64::MAX;
        config.polling.jitter_ms = u64::MAX;

        let settings = &config.line_settings()[0];
        assert_eq!(settings.silence_after(), Duration::from_millis(u64::MAX));
        assert_eq!(settings.heartbeat_repeat(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_validate_maps_to_bridge_error() {
        let result = GatewayConfig::from_json5(r#"{ polling: { interval_ms: 0 } }"#);
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }
}
