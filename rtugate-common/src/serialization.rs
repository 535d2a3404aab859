use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialization format for MQTT payloads.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format (human-readable, what most dashboards expect).
    #[default]
    Json,

    /// CBOR format (compact binary, for constrained uplinks).
    Cbor,
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(Error::from),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::Cbor(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MqttPayload, StatusCode};

    #[test]
    fn test_json_payload_shape() {
        let payload = MqttPayload::new(Some("21.5".to_string()), StatusCode::Ok, "OK", 0);

        let encoded = encode(&payload, Format::Json).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(json["value"], "21.5");
        assert_eq!(json["metadata"]["status_code"]["code"], 0);
        assert_eq!(json["metadata"]["status_code"]["message"], "OK");
        assert_eq!(json["metadata"]["status_code"]["silent_for_s"], 0);
        assert!(json["metadata"]["status_code"].get("alarm").is_none());
    }

    #[test]
    fn test_cbor_decodes_back() {
        let payload = MqttPayload::new(None, StatusCode::Silent, "no response", 42);

        let encoded = encode(&payload, Format::Cbor).unwrap();
        let decoded: MqttPayload = decode(&encoded, Format::Cbor).unwrap();

        assert_eq!(decoded.value, None);
        assert_eq!(decoded.metadata.status_code.code, StatusCode::Silent.code());
        assert_eq!(decoded.metadata.status_code.silent_for_s, 42);
    }

    #[test]
    fn test_cbor_is_smaller() {
        let payload = MqttPayload::new(Some("1".to_string()), StatusCode::Ok, "OK", 0);

        let json = encode(&payload, Format::Json).unwrap();
        let cbor = encode(&payload, Format::Cbor).unwrap();

        assert!(cbor.len() < json.len(), "CBOR should be smaller than JSON");
    }
}
