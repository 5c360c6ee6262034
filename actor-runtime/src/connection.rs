//! Client connections and the transports that carry them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actor_protocol::{ws::ToClient, EncodedMessage, ProtocolFormat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::ActorError;
use crate::state::to_state_value;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Ids are unique for the lifetime of the process.
pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transport closed")]
pub struct TransportClosed;

/// Delivers encoded frames to one client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a frame. Never blocks.
    fn send(&self, message: EncodedMessage) -> Result<(), TransportClosed>;

    /// Ask the transport to close. Safe to call more than once.
    fn close(&self, reason: Option<String>);

    /// Resolves once the transport has fully closed.
    async fn closed(&self);

    /// Persistent transports outlive a single request and can receive pushes.
    fn is_persistent(&self) -> bool;
}

/// Outbound work for a socket's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(EncodedMessage),
    Close(Option<String>),
}

/// A WebSocket session seen from the actor side.
///
/// Frames go to the session's writer task through `outbox`; the session
/// flips `closed` once the socket is gone.
pub struct WebSocketTransport {
    outbox: mpsc::UnboundedSender<Outbound>,
    closed: watch::Receiver<bool>,
}

impl WebSocketTransport {
    pub(crate) fn new(
        outbox: mpsc::UnboundedSender<Outbound>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self { outbox, closed }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn send(&self, message: EncodedMessage) -> Result<(), TransportClosed> {
        if *self.closed.borrow() {
            return Err(TransportClosed);
        }
        self.outbox
            .send(Outbound::Frame(message))
            .map_err(|_| TransportClosed)
    }

    fn close(&self, reason: Option<String>) {
        let _ = self.outbox.send(Outbound::Close(reason));
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // An error means the session dropped its sender, which is also closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// A one-shot HTTP request. It has no channel for pushes, so sends are
/// dropped.
#[derive(Debug)]
pub struct HttpTransport {
    closed: watch::Sender<bool>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            closed: watch::channel(false).0,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn send(&self, _message: EncodedMessage) -> Result<(), TransportClosed> {
        debug!("dropping push on http transport");
        Ok(())
    }

    fn close(&self, _reason: Option<String>) {
        self.closed.send_replace(true);
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// One client attached to the actor.
pub struct Connection {
    id: ConnectionId,
    format: ProtocolFormat,
    /// Present iff the actor declares a before-connect hook.
    state: Option<Mutex<Value>>,
    pub(crate) subscriptions: Mutex<BTreeSet<String>>,
    connected_at: DateTime<Utc>,
    transport: Arc<dyn Transport>,
}

impl Connection {
    pub fn new(
        format: ProtocolFormat,
        state: Option<Value>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: next_connection_id(),
            format,
            state: state.map(Mutex::new),
            subscriptions: Mutex::new(BTreeSet::new()),
            connected_at: Utc::now(),
            transport,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn format(&self) -> ProtocolFormat {
        self.format
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_persistent(&self) -> bool {
        self.transport.is_persistent()
    }

    pub fn state_enabled(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Result<Value, ActorError> {
        self.state
            .as_ref()
            .map(|state| state.lock().clone())
            .ok_or(ActorError::ConnectionStateNotEnabled)
    }

    pub fn set_state<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ActorError> {
        let slot = self
            .state
            .as_ref()
            .ok_or(ActorError::ConnectionStateNotEnabled)?;
        let value = to_state_value(value, "")?;
        *slot.lock() = value;
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscriptions.lock().contains(event)
    }

    /// Push an event to this connection only.
    pub fn send(&self, event: &str, args: Vec<Value>) -> Result<(), ActorError> {
        self.send_message(&ToClient::event(event, args))
    }

    pub(crate) fn send_message(&self, message: &ToClient) -> Result<(), ActorError> {
        let frame = actor_protocol::encode(message, self.format)?;
        self.send_frame(frame);
        Ok(())
    }

    /// Queue an already-encoded frame; a closed transport drops it.
    pub(crate) fn send_frame(&self, frame: EncodedMessage) {
        if self.transport.send(frame).is_err() {
            debug!(conn = self.id, "dropping frame for closed connection");
        }
    }

    /// Close the underlying transport. Cleanup follows once it is gone.
    pub fn disconnect(&self, reason: Option<String>) {
        debug!(conn = self.id, ?reason, "disconnecting");
        self.transport.close(reason);
    }

    pub async fn closed(&self) {
        self.transport.closed().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("persistent", &self.is_persistent())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingTransport;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique() {
        let transport = Arc::new(HttpTransport::new());
        let a = Connection::new(ProtocolFormat::Json, None, transport.clone());
        let b = Connection::new(ProtocolFormat::Json, None, transport);
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_connection_state_requires_hook() {
        let conn = Connection::new(ProtocolFormat::Json, None, Arc::new(HttpTransport::new()));
        assert!(matches!(conn.state(), Err(ActorError::ConnectionStateNotEnabled)));
        assert!(matches!(
            conn.set_state(&json!(1)),
            Err(ActorError::ConnectionStateNotEnabled)
        ));

        let conn = Connection::new(
            ProtocolFormat::Json,
            Some(json!({"user": "ada"})),
            Arc::new(HttpTransport::new()),
        );
        assert_eq!(conn.state().unwrap(), json!({"user": "ada"}));
        conn.set_state(&json!({"user": "grace"})).unwrap();
        assert_eq!(conn.state().unwrap(), json!({"user": "grace"}));
        assert!(conn.set_state(&f64::NAN).is_err());
    }

    #[test]
    fn test_send_encodes_in_connection_format() {
        let transport = Arc::new(RecordingTransport::new());
        let conn = Connection::new(ProtocolFormat::Cbor, None, transport.clone());
        conn.send("ping", vec![json!(1)]).unwrap();

        let frames = transport.frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], EncodedMessage::Binary(_)));
    }

    #[tokio::test]
    async fn test_http_transport_close_resolves_closed() {
        let transport = HttpTransport::new();
        assert!(!transport.is_persistent());
        transport.close(None);
        transport.closed().await;
    }

    #[tokio::test]
    async fn test_websocket_transport_rejects_after_close() {
        let (outbox, mut rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let transport = WebSocketTransport::new(outbox, closed_rx);

        transport
            .send(EncodedMessage::Text("hi".to_string()))
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));

        closed_tx.send_replace(true);
        transport.closed().await;
        assert_eq!(
            transport.send(EncodedMessage::Text("late".to_string())),
            Err(TransportClosed)
        );
    }
}
