//! Typed values over the byte-oriented cache
//!
//! Tiers only ever see bytes. A [`Codec`] turns application values into
//! bytes on the way in and back on the way out; a value that no longer
//! decodes (schema change, foreign writer) is treated like a miss by the
//! manager.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Encode/decode boundary between typed values and stored bytes
pub trait Codec<T> {
    /// Serialize a value
    fn encode(&self, value: &T) -> Result<Bytes>;

    /// Deserialize a value
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec backed by `serde_json`
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serialize `value` as JSON
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserialize JSON bytes
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::error::Error;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TaskList {
        week: u32,
        tasks: Vec<String>,
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec::<TaskList>::new();
        let value = TaskList {
            week: 5,
            tasks: vec!["plan".into(), "review".into()],
        };

        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_decode_mismatched_shape_fails() {
        let bytes = encode_json(&vec![1, 2, 3]).unwrap();
        let decoded: Result<TaskList> = decode_json(&bytes);
        assert!(matches!(decoded, Err(Error::Serialization(_))));
    }
}
