//! Framed message codec for the service channel.
//!
//! Each frame is a 4-byte big-endian length followed by a UTF-8 JSON object.
//! Decoding is restricted to the typed message enums, so an untrusted peer can
//! only ever produce plain data.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted in either direction.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl CodecError {
    pub fn is_malformed(&self) -> bool {
        match self {
            CodecError::Malformed(_) => true,
            // LengthDelimitedCodec reports oversized frames as InvalidData
            CodecError::Io(e) => e.kind() == io::ErrorKind::InvalidData,
        }
    }
}

/// Serialize a message payload (without the length prefix).
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Deserialize a message payload (without the length prefix).
///
/// Fails with `Malformed` for invalid UTF-8, invalid JSON, non-object values,
/// unknown `type` discriminators and missing fields.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(CodecError::Malformed(format!(
            "expected a mapping, got {}",
            json_kind(&value)
        )));
    }
    serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "sequence",
        serde_json::Value::Object(_) => "mapping",
    }
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_bytes)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = encode(&item)?;
        // No tracing here: this runs on the log-forwarding path.
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}
