//! Payload envelope: structured records exchanged above the
//! byte-agnostic transport, encoded as JSON.

use bytes::Bytes;
use serde_json::Value;

use crate::error::DispatchError;

/// Serialize a structured record into the bytes handed to
/// `rdt_transport::Engine::send`.
pub fn encode(value: &Value) -> Result<Bytes, DispatchError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(Bytes::from(bytes))
}

/// Parse bytes delivered by the transport back into a structured record.
/// Failures here are local decode errors; they never touch transport
/// state.
pub fn decode(bytes: &[u8]) -> Result<Value, DispatchError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_record() {
        let value = json!({"temperature": 21.5, "unit": "c"});
        let bytes = encode(&value).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn malformed_bytes_produce_codec_error() {
        let err = decode(b"not json").unwrap_err();
        assert!(matches!(err, DispatchError::Codec(_)));
    }
}
