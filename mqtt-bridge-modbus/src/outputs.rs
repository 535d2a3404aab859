//! Fan-out of accepted values to the cache, the broker, the history and the
//! alert flows.

use std::sync::Arc;

use rtugate_common::{MqttPayload, StatusCode, TelemetryEvent, current_timestamp_millis};

use crate::alerts::{AlertDispatcher, Notification, Trigger};
use crate::bridge::MqttBridge;
use crate::config::{ParamKey, RegisterType};
use crate::current::{CurrentStateCache, CurrentValue};
use crate::history::EventSink;

/// Per-parameter context resolved once when a line starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamContext {
    pub key: ParamKey,
    pub object: String,
    /// Absolute MQTT topic.
    pub topic: String,
    pub register_type: RegisterType,
    pub address: u16,
}

/// What is being reported for a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub value: Option<String>,
    pub status: StatusCode,
    pub message: String,
    pub silent_for_s: u64,
    pub alarm: Option<String>,
    pub trigger: Trigger,
}

#[derive(Clone)]
pub struct Outputs {
    current: CurrentStateCache,
    bridge: MqttBridge,
    history: Arc<dyn EventSink>,
    alerts: Option<AlertDispatcher>,
}

impl Outputs {
    pub fn new(current: CurrentStateCache, bridge: MqttBridge, history: Arc<dyn EventSink>) -> Self {
        Self {
            current,
            bridge,
            history,
            alerts: None,
        }
    }

    /// Also offer every emitted value to the alert flows.
    pub fn with_alerts(mut self, alerts: AlertDispatcher) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn current(&self) -> &CurrentStateCache {
        &self.current
    }

    pub fn bridge(&self) -> &MqttBridge {
        &self.bridge
    }

    pub fn alerts(&self) -> Option<&AlertDispatcher> {
        self.alerts.as_ref()
    }

    /// Update the cache, then publish, persist and notify. Never fails.
    pub fn emit(&self, ctx: &ParamContext, emission: Emission) {
        let timestamp = current_timestamp_millis();

        self.current.update(
            ctx.key.clone(),
            CurrentValue {
                object: ctx.object.clone(),
                topic: ctx.topic.clone(),
                register_type: ctx.register_type,
                address: ctx.address,
                value: emission.value.clone(),
                status: emission.status,
                message: emission.message.clone(),
                silent_for_s: emission.silent_for_s,
                alarm: emission.alarm.clone(),
                timestamp: Some(timestamp),
            },
        );

        let payload = MqttPayload::at(
            timestamp,
            emission.value.clone(),
            emission.status,
            emission.message.clone(),
            emission.silent_for_s,
        )
        .with_alarm(emission.alarm);
        self.bridge.publish(&ctx.topic, &payload);

        self.history.submit(TelemetryEvent {
            topic: ctx.topic.clone(),
            object: ctx.object.clone(),
            param: ctx.key.param.clone(),
            line: ctx.key.line.clone(),
            unit_id: ctx.key.unit_id,
            register_type: ctx.register_type.as_str().to_string(),
            address: ctx.address,
            value: emission.value.clone(),
            code: emission.status.code(),
            message: emission.message,
            silent_for_s: emission.silent_for_s,
            timestamp,
        });

        if let Some(ref alerts) = self.alerts {
            alerts.notify(Notification {
                key: ctx.key.clone(),
                value: emission.value,
                trigger: emission.trigger,
                timestamp,
            });
        }
    }
}

impl std::fmt::Debug for Outputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outputs")
            .field("bridge", &self.bridge)
            .field("current", &self.current.len())
            .field("alerts", &self.alerts.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rtugate_bridge_framework::MessageSink;
    use rtugate_common::{Format, TopicResolver};

    #[derive(Default)]
    struct Recording {
        topics: Mutex<Vec<String>>,
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl MessageSink for Recording {
        fn publish(&self, topic: &str, _payload: Vec<u8>) -> rtugate_bridge_framework::Result<()> {
            self.topics.lock().push(topic.to_string());
            Ok(())
        }
    }

    impl EventSink for Recording {
        fn submit(&self, event: TelemetryEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_emit_reaches_all_outputs() {
        let sink = Arc::new(Recording::default());
        let bridge = MqttBridge::new(sink.clone(), TopicResolver::default(), Format::Json);
        let outputs = Outputs::new(CurrentStateCache::new(), bridge, sink.clone());

        let ctx = ParamContext {
            key: ParamKey::new("line1", 2, "fault"),
            object: "pump".to_string(),
            topic: "/devices/pump/controls/fault".to_string(),
            register_type: RegisterType::Discrete,
            address: 4,
        };
        outputs.emit(
            &ctx,
            Emission {
                value: Some("1".to_string()),
                status: StatusCode::Ok,
                message: "OK".to_string(),
                silent_for_s: 0,
                alarm: Some("Pump fault".to_string()),
                trigger: Trigger::Event,
            },
        );

        assert_eq!(*sink.topics.lock(), vec![ctx.topic.clone()]);

        let events = sink.events.lock();
        assert_eq!(events[0].register_type, "discrete");
        assert_eq!(events[0].unit_id, 2);
        assert_eq!(events[0].value.as_deref(), Some("1"));

        let current = outputs.current().get(&ctx.key).unwrap();
        assert_eq!(current.alarm.as_deref(), Some("Pump fault"));
        assert_eq!(current.timestamp, Some(events[0].timestamp));
    }
}
