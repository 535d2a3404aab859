//! Telemetry publisher for MQTT.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use rtugate_common::{Format, MqttConfig, TopicResolver};

use crate::error::{BridgeError, Result};

/// Delay before the event loop is polled again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Destination for encoded telemetry messages.
///
/// Implementations must not block: a publish that cannot be queued returns
/// an error and the message is dropped by the caller.
pub trait MessageSink: Send + Sync {
    /// Queue `payload` for publication on the absolute `topic`.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Map a configured QoS level to the client enum.
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BridgeError::validation(format!(
            "mqtt.qos must be 0, 1 or 2 (got {})",
            other
        ))),
    }
}

/// Publisher for sending telemetry to an MQTT broker.
///
/// Wraps an [`AsyncClient`]; the matching [`EventLoop`] must be driven by
/// [`spawn_event_loop`] for queued messages to leave the process.
#[derive(Clone, Debug)]
pub struct Publisher {
    client: AsyncClient,
    topics: TopicResolver,
    qos: QoS,
    retain: bool,
    format: Format,
}

impl Publisher {
    /// Create a client for the configured broker.
    ///
    /// Registers a retained `offline` last will on the status topic so that
    /// subscribers see the bridge disappear even on a crash.
    pub fn connect(config: &MqttConfig) -> Result<(Self, EventLoop)> {
        let qos = qos_from_level(config.qos)?;
        let topics = TopicResolver::new(&config.base_topic);

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_s.max(5)));
        if let Some(ref username) = config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            topics.status_topic(),
            br#"{"status":"offline"}"#.to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, config.queue_capacity);

        Ok((
            Self {
                client,
                topics,
                qos,
                retain: config.retain,
                format: config.payload_format,
            },
            event_loop,
        ))
    }

    /// Get the topic resolver.
    pub fn topics(&self) -> &TopicResolver {
        &self.topics
    }

    /// Get the serialization format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Queue an already-encoded payload without waiting.
    pub fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, self.qos, self.retain, payload)
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    /// Queue a retained QoS 1 JSON document (status messages).
    ///
    /// Like [`Publisher::try_publish`] this never waits for queue space, so
    /// it cannot stall while the broker is unreachable.
    pub fn publish_json_retained<T: serde::Serialize>(&self, topic: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    /// Queue a DISCONNECT for the broker without waiting for queue space.
    pub fn disconnect(&self) -> Result<()> {
        self.client.try_disconnect()?;
        Ok(())
    }
}

impl MessageSink for Publisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.try_publish(topic, payload)
    }
}

/// Drive the MQTT event loop until the client disconnects.
///
/// Connection errors are logged and retried after a short delay; rumqttc
/// reconnects on the next poll.
pub fn spawn_event_loop(mut event_loop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(code = ?ack.code, "Connected to MQTT broker");
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    tracing::debug!("MQTT client disconnecting");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "MQTT connection error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    })
}
