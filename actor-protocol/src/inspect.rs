//! Payloads for the inspection side-channel (`/__inspect/connect`).

use serde::{Deserialize, Serialize};

/// RPC answered with a full [`InspectRpcResponse`].
pub const INSPECT_RPC: &str = "inspect";

/// RPC that overwrites the actor state.
pub const SET_STATE_RPC: &str = "setState";

/// Pushed to subscribed inspectors when the actor state changes.
pub const STATE_CHANGED_EVENT: &str = "_state-changed";

/// Pushed to subscribed inspectors when connections or subscriptions change.
pub const CONNECTIONS_CHANGED_EVENT: &str = "_connections-changed";

/// Pushed to subscribed inspectors whenever the actor broadcasts an event.
pub const EVENT_EMITTED_EVENT: &str = "_event-emitted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectRpcResponse {
    pub rpcs: Vec<String>,
    pub state: InspectState,
    pub connections: Vec<InspectConnection>,
}

/// A value rendered for humans. `native` is the JSON text of the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectState {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectConnection {
    pub id: String,
    pub subscriptions: Vec<String>,
    pub state: InspectState,
    pub format: crate::ProtocolFormat,
    pub connected_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEmitted {
    pub name: String,
}
