//! CBOR codec backed by `ciborium`.

use crate::error::{CodecError, CodecResult};
use crate::value::WireValue;
use crate::Codec;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes native values as CBOR using their `serde` representation.
///
/// This is the default codec of the driver. It is stateless, so a single
/// instance can be shared by every transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl CborCodec {
    /// Creates a new CBOR codec.
    pub fn new() -> Self {
        Self
    }
}

impl Codec for CborCodec {
    fn encode<T>(&self, value: &T) -> CodecResult<WireValue>
    where
        T: Serialize + ?Sized,
    {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Ok(WireValue::from(buf))
    }

    fn decode<T>(&self, value: &WireValue) -> CodecResult<T>
    where
        T: DeserializeOwned,
    {
        if value.is_empty() {
            return Err(CodecError::EmptyValue);
        }
        ciborium::de::from_reader(value.as_bytes())
            .map_err(|e| CodecError::decoding_failed(e.to_string()))
    }
}
