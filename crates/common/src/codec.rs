//! Canonical CBOR (de)serialization.
//!
//! All persisted consensus values go through this module so the wire format
//! lives in exactly one place. Encoding a derive-annotated consensus type
//! cannot fail, mirroring how the state layer treats serialization as
//! infallible for its own types.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("codec: malformed value: {0}")]
pub struct DecodeError(#[from] serde_cbor::Error);

/// Encodes a value as CBOR.
pub fn to_vec<T: Serialize>(value: &T) -> Vec<u8> {
    serde_cbor::to_vec(value).expect("consensus types serialize infallibly")
}

/// Decodes a CBOR value.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
    Ok(serde_cbor::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        label: String,
    }

    #[test]
    fn roundtrip() {
        let value = Sample {
            id: 9,
            label: "epoch".into(),
        };
        let bytes = to_vec(&value);
        let back: Sample = from_slice(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn rejects_garbage() {
        assert!(from_slice::<Sample>(&[0xff, 0x00, 0x13]).is_err());
    }
}
