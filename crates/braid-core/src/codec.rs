//! CBOR helpers for wire payloads.
//!
//! Every message that crosses a transport stream is a CBOR document inside a
//! length-delimited frame. The framing lives in `braid-p2p`; this module only
//! turns values into bytes and back.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Encode a value to CBOR bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Decode a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        height: u64,
        tag: String,
    }

    #[test]
    fn test_encode_decode() {
        let sample = Sample {
            height: 42,
            tag: "snap".into(),
        };
        let bytes = encode(&sample).unwrap();
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode::<Sample>(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CoreError::DecodingError(_)));
    }
}
