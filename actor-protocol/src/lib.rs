//! Shared wire types for the actor runtime
//!
//! This crate provides the envelopes exchanged between clients and a hosted
//! actor, over both WebSocket and one-shot HTTP, along with the JSON/CBOR
//! codec used to put them on the wire.

pub mod codec;
pub mod http;
pub mod inspect;
pub mod ws;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use codec::{decode, encode, CodecError, EncodedMessage, RawMessage};

/// Wire encoding negotiated once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFormat {
    Json,
    Cbor,
}

impl ProtocolFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFormat::Json => "json",
            ProtocolFormat::Cbor => "cbor",
        }
    }

    /// Content type used for HTTP bodies in this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            ProtocolFormat::Json => "application/json",
            ProtocolFormat::Cbor => "application/cbor",
        }
    }
}

impl fmt::Display for ProtocolFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a format name is not one of `json` or `cbor`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol format: {0}")]
pub struct UnknownFormat(pub String);

impl FromStr for ProtocolFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ProtocolFormat::Json),
            "cbor" => Ok(ProtocolFormat::Cbor),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}
