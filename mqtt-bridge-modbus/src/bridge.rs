//! MQTT side of the gateway: topics and payloads.

use std::sync::Arc;

use rtugate_bridge_framework::{MessageSink, Publisher};
use rtugate_common::{Format, MqttPayload, TopicResolver, encode};
use tracing::warn;

use crate::config::RegisterType;

/// String form of a value as carried in payloads.
///
/// Bit registers are always `"0"` or `"1"`.
pub fn format_value(value: f64, register_type: RegisterType) -> String {
    match register_type.is_bit() {
        true if value != 0.0 => "1".to_string(),
        true => "0".to_string(),
        false => value.to_string(),
    }
}

/// Publishes telemetry payloads without ever failing the caller.
#[derive(Clone)]
pub struct MqttBridge {
    sink: Arc<dyn MessageSink>,
    topics: TopicResolver,
    format: Format,
}

impl MqttBridge {
    pub fn new(sink: Arc<dyn MessageSink>, topics: TopicResolver, format: Format) -> Self {
        Self {
            sink,
            topics,
            format,
        }
    }

    /// Bridge over a connected publisher, using its base topic and format.
    pub fn from_publisher(publisher: Publisher) -> Self {
        let topics = publisher.topics().clone();
        let format = publisher.format();
        Self::new(Arc::new(publisher), topics, format)
    }

    /// Absolute topic for a configured topic.
    pub fn resolve(&self, topic: &str) -> String {
        self.topics.resolve(topic)
    }

    /// Encode and queue `payload`. Failures are logged and reported as `false`.
    pub fn publish(&self, topic: &str, payload: &MqttPayload) -> bool {
        let bytes = match encode(payload, self.format) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to encode payload");
                return false;
            }
        };

        match self.sink.publish(topic, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %topic, error = %e, "MQTT publish failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for MqttBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBridge")
            .field("base", &self.topics.base())
            .field("format", &self.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rtugate_bridge_framework::BridgeError;
    use rtugate_common::{StatusCode, decode};

    #[derive(Default)]
    struct Recording {
        messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MessageSink for Recording {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> rtugate_bridge_framework::Result<()> {
            self.messages.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct Refusing;

    impl MessageSink for Refusing {
        fn publish(&self, topic: &str, _payload: Vec<u8>) -> rtugate_bridge_framework::Result<()> {
            Err(BridgeError::Publish {
                topic: topic.to_string(),
                message: "queue full".to_string(),
            })
        }
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(21.5, RegisterType::Holding), "21.5");
        assert_eq!(format_value(7.0, RegisterType::Input), "7");
        assert_eq!(format_value(1.0, RegisterType::Coil), "1");
        assert_eq!(format_value(0.0, RegisterType::Discrete), "0");
    }

    #[test]
    fn test_publish_json() {
        let sink = Arc::new(Recording::default());
        let bridge = MqttBridge::new(sink.clone(), TopicResolver::new("/devices"), Format::Json);

        let topic = bridge.resolve("boiler/temp");
        let payload = MqttPayload::new(Some("21.5".to_string()), StatusCode::Ok, "OK", 0);
        assert!(bridge.publish(&topic, &payload));

        let messages = sink.messages.lock();
        assert_eq!(messages[0].0, "/devices/boiler/temp");
        let decoded: MqttPayload = decode(&messages[0].1, Format::Json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_publish_cbor() {
        let sink = Arc::new(Recording::default());
        let bridge = MqttBridge::new(sink.clone(), TopicResolver::new("/devices"), Format::Cbor);

        let payload = MqttPayload::new(None, StatusCode::Silent, "TIMEOUT: no response", 12);
        assert!(bridge.publish("/abs/topic", &payload));

        let messages = sink.messages.lock();
        let decoded: MqttPayload = decode(&messages[0].1, Format::Cbor).unwrap();
        assert_eq!(decoded.metadata.status_code.silent_for_s, 12);
    }

    #[test]
    fn test_publish_failure_is_swallowed() {
        let bridge = MqttBridge::new(Arc::new(Refusing), TopicResolver::default(), Format::Json);
        let payload = MqttPayload::new(Some("1".to_string()), StatusCode::Ok, "OK", 0);

        assert!(!bridge.publish("/devices/x", &payload));
    }
}
