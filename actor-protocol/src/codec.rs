//! JSON/CBOR encoding with an incoming size ceiling.
//!
//! JSON travels as UTF-8 text frames, CBOR as binary frames. The size check
//! happens before any parsing so oversized frames are never deserialized.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolFormat;

/// An outgoing frame, already serialized for one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl EncodedMessage {
    /// Raw bytes, regardless of frame kind.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            EncodedMessage::Text(text) => text.into_bytes(),
            EncodedMessage::Binary(bytes) => bytes,
        }
    }
}

/// A borrowed incoming frame.
#[derive(Debug, Clone, Copy)]
pub enum RawMessage<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl RawMessage<'_> {
    pub(crate) fn len(&self) -> usize {
        match self {
            RawMessage::Text(text) => text.len(),
            RawMessage::Binary(bytes) => bytes.len(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message too long: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLong { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

pub fn encode<T>(value: &T, format: ProtocolFormat) -> Result<EncodedMessage, CodecError>
where
    T: Serialize + ?Sized,
{
    match format {
        ProtocolFormat::Json => serde_json::to_string(value)
            .map(EncodedMessage::Text)
            .map_err(|e| CodecError::Encode(e.to_string())),
        ProtocolFormat::Cbor => {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(value, &mut buf)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            Ok(EncodedMessage::Binary(buf))
        }
    }
}

pub fn decode<T>(raw: RawMessage<'_>, format: ProtocolFormat, max_size: usize) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    let size = raw.len();
    if size > max_size {
        return Err(CodecError::MessageTooLong {
            size,
            limit: max_size,
        });
    }

    match (format, raw) {
        (ProtocolFormat::Json, RawMessage::Text(text)) => {
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        (ProtocolFormat::Json, RawMessage::Binary(bytes)) => {
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        (ProtocolFormat::Cbor, RawMessage::Binary(bytes)) => {
            ciborium::de::from_reader(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        (ProtocolFormat::Cbor, RawMessage::Text(_)) => Err(CodecError::Malformed(
            "cbor connections only accept binary frames".to_string(),
        )),
    }
}
