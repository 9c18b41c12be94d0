//! Pluggable payload encoding.
//!
//! Payloads travel as [`serde_json::Value`] between the caller and the
//! serializer, so any `Serialize` type can be emitted and handlers receive a
//! self-describing value regardless of the wire format.

use std::fmt;

use serde_json::Value;

/// Errors from encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    /// The value could not be turned into bytes
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    /// The bytes could not be turned into a value
    #[error("Failed to decode payload: {0}")]
    Decode(String),
}

/// Encodes payloads for publishing and decodes them on delivery.
pub trait Serializer: Send + Sync + fmt::Debug {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializerError>;

    fn decode(&self, data: &[u8]) -> Result<Value, SerializerError>;

    /// MIME type recorded in the message properties.
    fn content_type(&self) -> &'static str;
}

/// JSON encoding, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, SerializerError> {
        serde_json::from_slice(data).map_err(|e| SerializerError::Decode(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_json_encoding() {
        let serializer = JsonSerializer;
        let bytes = serializer.encode(&json!({"id": 7, "tags": ["a"]})).unwrap();
        assert_eq!(bytes, br#"{"id":7,"tags":["a"]}"#);
        assert_eq!(serializer.content_type(), "application/json");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = JsonSerializer.decode(b"{not json").unwrap_err();
        assert!(matches!(err, SerializerError::Decode(_)));
    }

    #[test]
    fn test_floats_survive_exactly() {
        let serializer = JsonSerializer;
        for f in [
            1.0715660391465826e-75,
            -1.603964615428183e+143,
            0.1 + 0.2,
            f64::MIN_POSITIVE,
            f64::MAX,
        ] {
            let bytes = serializer.encode(&json!(f)).unwrap();
            let decoded = serializer.decode(&bytes).unwrap();
            assert_eq!(decoded.as_f64().unwrap().to_bits(), f.to_bits(), "{}", f);
        }
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            any::<f64>()
                .prop_filter("finite", |f| f.is_finite())
                .prop_map(|f| json!(f)),
            "[a-zA-Z0-9 ._-]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_json_round_trip(value in arb_json()) {
            let serializer = JsonSerializer;
            let bytes = serializer.encode(&value).unwrap();
            prop_assert_eq!(serializer.decode(&bytes).unwrap(), value);
        }
    }
}
