//! rtugate Bridge Framework
//!
//! Common abstractions for building field-bus bridges that publish telemetry to MQTT.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, reload, shutdown)
//! - [`Publisher`] for publishing encoded telemetry through `rumqttc`
//! - [`MessageSink`] as the seam between telemetry producers and the broker
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::{MessageSink, Publisher, qos_from_level, spawn_event_loop};
pub use runner::BridgeRunner;
pub use status::{BridgeState, BridgeStatus};

// Re-export commonly used types from rtugate-common
pub use rtugate_common::{
    Format, LogFormat, LoggingConfig, MqttConfig, MqttPayload, StatusCode, TelemetryEvent,
    TopicResolver,
};
