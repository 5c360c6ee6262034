//! WebSocket envelopes.
//!
//! Every frame carries exactly one object with a single `body` key. Field
//! names are abbreviated to keep frames small; the Rust names spell them out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToServer {
    pub body: ToServerBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToServerBody {
    /// Invoke an RPC; answered by `ro` or `re` with the same id.
    #[serde(rename = "rr")]
    RpcRequest(RpcRequest),

    /// Toggle a subscription to a named event.
    #[serde(rename = "sr")]
    SubscriptionRequest(SubscriptionRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "i")]
    pub id: u64,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "a", default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "e")]
    pub event: String,
    #[serde(rename = "s")]
    pub subscribe: bool,
}

/// Frame sent by the actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToClient {
    pub body: ToClientBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToClientBody {
    #[serde(rename = "ro")]
    RpcResponseOk(RpcResponseOk),

    #[serde(rename = "re")]
    RpcResponseError(RpcResponseError),

    #[serde(rename = "ev")]
    Event(EventMessage),

    /// Connection-level error not tied to an RPC id (malformed frame, etc).
    #[serde(rename = "er")]
    Error(ConnectionError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponseOk {
    #[serde(rename = "i")]
    pub id: u64,
    #[serde(rename = "o")]
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponseError {
    #[serde(rename = "i")]
    pub id: u64,
    #[serde(rename = "c")]
    pub code: String,
    #[serde(rename = "m")]
    pub message: String,
    #[serde(rename = "md", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "a")]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionError {
    #[serde(rename = "c")]
    pub code: String,
    #[serde(rename = "m")]
    pub message: String,
    #[serde(rename = "md", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToClient {
    pub fn rpc_ok(id: u64, output: Value) -> Self {
        Self {
            body: ToClientBody::RpcResponseOk(RpcResponseOk { id, output }),
        }
    }

    pub fn rpc_error(id: u64, code: String, message: String, metadata: Option<Value>) -> Self {
        Self {
            body: ToClientBody::RpcResponseError(RpcResponseError {
                id,
                code,
                message,
                metadata,
            }),
        }
    }

    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            body: ToClientBody::Event(EventMessage {
                name: name.into(),
                args,
            }),
        }
    }

    pub fn error(code: String, message: String, metadata: Option<Value>) -> Self {
        Self {
            body: ToClientBody::Error(ConnectionError {
                code,
                message,
                metadata,
            }),
        }
    }
}
