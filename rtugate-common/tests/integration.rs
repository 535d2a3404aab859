//! Integration tests for rtugate-common library.

use rtugate_common::{
    Format, MqttConfig, MqttPayload, StatusCode, TopicResolver, decode, default_param_topic,
    encode, parse_config,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct BrokerOnly {
    mqtt: MqttConfig,
}

#[test]
fn test_topic_and_payload_workflow() {
    let config: BrokerOnly = parse_config(
        r#"{ mqtt: { host: "10.0.0.2", base_topic: "site7/", payload_format: "json" } }"#,
    )
    .expect("parse failed");

    let resolver = TopicResolver::new(&config.mqtt.base_topic);
    let topic = resolver.resolve(&default_param_topic("pump1", "pressure"));
    assert_eq!(topic, "/site7/pump1/controls/pressure");

    let payload = MqttPayload::new(Some("4.2".to_string()), StatusCode::Ok, "OK", 0);
    let bytes = encode(&payload, config.mqtt.payload_format).expect("encode failed");
    let decoded: MqttPayload = decode(&bytes, Format::Json).expect("decode failed");

    assert_eq!(decoded.value.as_deref(), Some("4.2"));
    assert_eq!(decoded.metadata.status_code.code, 0);
    assert!(decoded.metadata.timestamp.ends_with('Z'));
}

#[test]
fn test_absolute_topics_ignore_base() {
    let resolver = TopicResolver::new("/devices");
    assert_eq!(resolver.resolve("/plant/boiler/temp"), "/plant/boiler/temp");
    assert_eq!(resolver.resolve("temp"), "/devices/temp");
}

#[test]
fn test_silent_payload_has_null_value() {
    let payload = MqttPayload::new(None, StatusCode::Silent, "no response for 12s", 12);
    let json: serde_json::Value =
        serde_json::from_slice(&encode(&payload, Format::Json).unwrap()).unwrap();

    assert!(json["value"].is_null());
    assert_eq!(json["metadata"]["status_code"]["code"], 20);
    assert_eq!(json["metadata"]["status_code"]["silent_for_s"], 12);
}
