//! CBOR payload helpers for the commands the server itself understands.

use bytes::Bytes;
use ciborium::Value;
use serde::Serialize;

use crate::error::ServerError;

/// Encodes `value` as a CBOR payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, ServerError> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)
        .map_err(|e| ServerError::Internal(format!("payload encoding failed: {e}")))?;
    Ok(Bytes::from(out))
}

/// Decodes a payload that must be a CBOR array.
pub fn decode_array(payload: &[u8]) -> Option<Vec<Value>> {
    match ciborium::from_reader::<Value, _>(payload).ok()? {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

/// Text or byte string content of a value.
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
        _ => None,
    }
}

pub fn as_i32(value: &Value) -> Option<i32> {
    value
        .as_integer()
        .and_then(|i| i32::try_from(i128::from(i)).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_payloads() {
        let payload = encode(&("alice", 3, true)).unwrap();
        let items = decode_array(&payload).unwrap();
        assert_eq!(as_string(&items[0]).as_deref(), Some("alice"));
        assert_eq!(as_i32(&items[1]), Some(3));
        assert_eq!(as_i32(&items[2]), None);
    }

    #[test]
    fn test_non_array_payload() {
        let payload = encode("just text").unwrap();
        assert!(decode_array(&payload).is_none());
        assert!(decode_array(b"\xff\xff").is_none());
    }
}
