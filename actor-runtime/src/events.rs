//! Connection registry, event subscriptions and fan-out.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use actor_protocol::{ws::ToClient, CodecError, EncodedMessage, ProtocolFormat};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::connection::{Connection, ConnectionId};

#[derive(Default)]
struct RegistryInner {
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    subscribers: HashMap<String, BTreeSet<ConnectionId>>,
}

/// Live connections and the event index.
///
/// Both maps sit behind one lock, and each connection's own subscription set
/// is only touched while that lock is held, so they never disagree.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.inner.lock().connections.insert(conn.id(), conn);
    }

    /// Remove a connection and every subscription it holds. Returns `None`
    /// if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let conn = inner.connections.remove(&id)?;
        let events: Vec<String> = std::mem::take(&mut *conn.subscriptions.lock())
            .into_iter()
            .collect();
        for event in events {
            drop_subscriber(&mut inner.subscribers, &event, id);
        }
        Some(conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.values().cloned().collect()
    }

    /// Returns false if the connection is not registered.
    pub fn subscribe(&self, id: ConnectionId, event: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(conn) = inner.connections.get(&id).cloned() else {
            return false;
        };
        conn.subscriptions.lock().insert(event.to_string());
        inner
            .subscribers
            .entry(event.to_string())
            .or_default()
            .insert(id);
        debug!(conn = id, event, "subscribed");
        true
    }

    pub fn unsubscribe(&self, id: ConnectionId, event: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(conn) = inner.connections.get(&id).cloned() else {
            return false;
        };
        conn.subscriptions.lock().remove(event);
        drop_subscriber(&mut inner.subscribers, event, id);
        debug!(conn = id, event, "unsubscribed");
        true
    }

    pub fn subscribers(&self, event: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .subscribers
            .get(event)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub fn has_subscribers(&self, event: &str) -> bool {
        self.inner.lock().subscribers.contains_key(event)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    /// Events with at least one subscriber.
    #[cfg(test)]
    pub(crate) fn indexed_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.inner.lock().subscribers.keys().cloned().collect();
        events.sort();
        events
    }
}

fn drop_subscriber(
    subscribers: &mut HashMap<String, BTreeSet<ConnectionId>>,
    event: &str,
    id: ConnectionId,
) {
    if let Some(ids) = subscribers.get_mut(event) {
        ids.remove(&id);
        if ids.is_empty() {
            subscribers.remove(event);
        }
    }
}

/// Deliver `message` to every subscriber, encoding it at most once per
/// format. Returns the number of deliveries.
pub fn fan_out<F>(subscribers: &[Arc<Connection>], message: &ToClient, mut encode: F) -> usize
where
    F: FnMut(&ToClient, ProtocolFormat) -> Result<EncodedMessage, CodecError>,
{
    let mut encoded: HashMap<ProtocolFormat, Option<EncodedMessage>> = HashMap::new();
    let mut delivered = 0;

    for conn in subscribers {
        let frame = encoded.entry(conn.format()).or_insert_with(|| {
            encode(message, conn.format())
                .map_err(|err| error!(?err, format = %conn.format(), "failed to encode event"))
                .ok()
        });
        if let Some(frame) = frame {
            conn.send_frame(frame.clone());
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::RecordingTransport;
    use serde_json::json;

    fn conn(format: ProtocolFormat) -> (Arc<Connection>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        (
            Arc::new(Connection::new(format, None, transport.clone())),
            transport,
        )
    }

    #[test]
    fn test_fan_out_encodes_once_per_format() {
        let registry = Registry::new();
        let (a, ta) = conn(ProtocolFormat::Json);
        let (b, tb) = conn(ProtocolFormat::Json);
        let (c, tc) = conn(ProtocolFormat::Cbor);
        for each in [&a, &b, &c] {
            registry.insert(each.clone());
            registry.subscribe(each.id(), "changed");
        }

        let mut encodes = 0;
        let delivered = fan_out(
            &registry.subscribers("changed"),
            &ToClient::event("changed", vec![json!(5)]),
            |msg, format| {
                encodes += 1;
                actor_protocol::encode(msg, format)
            },
        );

        assert_eq!(encodes, 2);
        assert_eq!(delivered, 3);
        for transport in [ta, tb, tc] {
            assert_eq!(transport.frames.lock().len(), 1);
        }
    }

    #[test]
    fn test_fan_out_without_subscribers_is_noop() {
        let registry = Registry::new();
        let delivered = fan_out(
            &registry.subscribers("nobody"),
            &ToClient::event("nobody", vec![]),
            |_, _| panic!("nothing to encode"),
        );
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_remove_cleans_every_index_entry() {
        let registry = Registry::new();
        let (a, _) = conn(ProtocolFormat::Json);
        let (b, _) = conn(ProtocolFormat::Json);
        registry.insert(a.clone());
        registry.insert(b.clone());

        registry.subscribe(a.id(), "x");
        registry.subscribe(a.id(), "y");
        registry.subscribe(b.id(), "y");

        assert!(registry.remove(a.id()).is_some());
        assert_eq!(registry.indexed_events(), vec!["y".to_string()]);
        assert!(a.subscriptions().is_empty());
        assert!(registry.remove(a.id()).is_none(), "removal is idempotent");

        registry.remove(b.id());
        assert!(registry.indexed_events().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_drops_empty_entries() {
        let registry = Registry::new();
        let (a, _) = conn(ProtocolFormat::Json);
        registry.insert(a.clone());

        registry.subscribe(a.id(), "x");
        assert!(registry.has_subscribers("x"));
        assert!(a.is_subscribed("x"));

        registry.unsubscribe(a.id(), "x");
        assert!(!registry.has_subscribers("x"));
        assert!(!a.is_subscribed("x"));
    }

    #[test]
    fn test_subscribe_unknown_connection() {
        let registry = Registry::new();
        assert!(!registry.subscribe(42, "x"));
        assert!(registry.indexed_events().is_empty());
    }
}
