//! Inspection side-channel served on `/__inspect/connect`.
//!
//! Inspector sockets speak the regular envelope. Two extra RPCs are
//! answered here; anything else goes to the actor's own dispatcher.
//! Inspectors can also subscribe to change notifications, which are
//! throttled and never reach regular clients.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use actor_protocol::inspect::{
    EventEmitted, InspectConnection, InspectRpcResponse, InspectState, CONNECTIONS_CHANGED_EVENT,
    EVENT_EMITTED_EVENT, INSPECT_RPC, SET_STATE_RPC, STATE_CHANGED_EVENT,
};
use actor_protocol::ws::ToClient;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::actor::Instance;
use crate::connection::Connection;
use crate::error::ActorError;
use crate::events::{fan_out, Registry};
use crate::rpc::RpcArgs;
use crate::state::StateHandle;

/// Largest rendering of a state value shown to inspectors.
pub const MAX_INSPECT_STATE_SIZE: usize = 128 * 1024 * 1024;

const STATE_CHANGED_INTERVAL: Duration = Duration::from_millis(500);
const CONNECTIONS_CHANGED_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_EMITTED_INTERVAL: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Throttle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ThrottleState {
    last_fire: Option<Instant>,
    scheduled: bool,
}

/// Leading-edge throttle with one trailing call. The trailing call runs
/// the closure it was given at schedule time, so emitters should read
/// fresh data when they fire.
#[derive(Debug)]
pub(crate) struct Throttle {
    interval: Duration,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    pub(crate) fn trigger<F>(&self, emit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.scheduled {
            return;
        }

        let now = Instant::now();
        match state.last_fire {
            Some(last) if now.duration_since(last) < self.interval => {
                state.scheduled = true;
                let fire_at = last + self.interval;
                let shared = self.state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(fire_at).await;
                    {
                        let mut state = shared.lock();
                        state.scheduled = false;
                        state.last_fire = Some(Instant::now());
                    }
                    emit();
                });
            }
            _ => {
                state.last_fire = Some(now);
                drop(state);
                emit();
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspector
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct Inspector {
    instance: Weak<Instance>,
    registry: Registry,
    state_throttle: Throttle,
    connections_throttle: Throttle,
    events_throttle: Throttle,
    last_event: Arc<Mutex<Option<String>>>,
}

impl Inspector {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            registry: Registry::new(),
            state_throttle: Throttle::new(STATE_CHANGED_INTERVAL),
            connections_throttle: Throttle::new(CONNECTIONS_CHANGED_INTERVAL),
            events_throttle: Throttle::new(EVENT_EMITTED_INTERVAL),
            last_event: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.all()
    }

    pub(crate) fn state_changed(&self) {
        if !self.registry.has_subscribers(STATE_CHANGED_EVENT) {
            return;
        }
        let instance = self.instance.clone();
        self.state_throttle.trigger(move || {
            if let Some(instance) = instance.upgrade() {
                let payload = inspect_state(&instance);
                instance.inspector.push(STATE_CHANGED_EVENT, &payload);
            }
        });
    }

    pub(crate) fn connections_changed(&self) {
        if !self.registry.has_subscribers(CONNECTIONS_CHANGED_EVENT) {
            return;
        }
        let instance = self.instance.clone();
        self.connections_throttle.trigger(move || {
            if let Some(instance) = instance.upgrade() {
                let payload = inspect_connections(&instance);
                instance.inspector.push(CONNECTIONS_CHANGED_EVENT, &payload);
            }
        });
    }

    pub(crate) fn event_emitted(&self, name: &str) {
        if !self.registry.has_subscribers(EVENT_EMITTED_EVENT) {
            return;
        }
        *self.last_event.lock() = Some(name.to_string());
        let instance = self.instance.clone();
        let last_event = self.last_event.clone();
        self.events_throttle.trigger(move || {
            let Some(name) = last_event.lock().take() else {
                return;
            };
            if let Some(instance) = instance.upgrade() {
                instance
                    .inspector
                    .push(EVENT_EMITTED_EVENT, &EventEmitted { name });
            }
        });
    }

    fn push<T: Serialize>(&self, event: &str, payload: &T) {
        let subscribers = self.registry.subscribers(event);
        if subscribers.is_empty() {
            return;
        }
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(?err, event, "failed to render inspector payload");
                return;
            }
        };
        let message = ToClient::event(event, vec![payload]);
        let delivered = fan_out(&subscribers, &message, |msg, format| {
            actor_protocol::encode(msg, format)
        });
        debug!(event, delivered, "inspector notified");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// `io::Write` sink that refuses to grow past `limit` bytes.
struct LimitedWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl io::Write for LimitedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            return Err(io::Error::other("value exceeds inspection limit"));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// JSON text of `value`, or an `_error` object when it exceeds `limit`.
pub(crate) fn render_native(value: &Value, limit: usize) -> String {
    let mut writer = LimitedWriter {
        buf: Vec::new(),
        limit,
    };
    match serde_json::to_writer(&mut writer, value) {
        Ok(()) => String::from_utf8_lossy(&writer.buf).into_owned(),
        Err(_) => {
            let err = ActorError::StateTooLarge;
            json!({ "_error": { "code": err.code(), "message": err.to_string() } }).to_string()
        }
    }
}

fn inspect_state(instance: &Instance) -> InspectState {
    InspectState {
        enabled: instance.state.enabled(),
        native: instance
            .state
            .read(|state| render_native(state, MAX_INSPECT_STATE_SIZE))
            .ok(),
    }
}

fn inspect_connection(conn: &Connection) -> InspectConnection {
    InspectConnection {
        id: conn.id().to_string(),
        subscriptions: conn.subscriptions(),
        state: InspectState {
            enabled: conn.state_enabled(),
            native: conn
                .state()
                .ok()
                .map(|state| render_native(&state, MAX_INSPECT_STATE_SIZE)),
        },
        format: conn.format(),
        connected_at: conn.connected_at().to_rfc3339(),
    }
}

fn inspect_connections(instance: &Instance) -> Vec<InspectConnection> {
    instance
        .registry
        .all()
        .iter()
        .map(|conn| inspect_connection(conn))
        .collect()
}

pub(crate) fn inspect(instance: &Instance) -> InspectRpcResponse {
    InspectRpcResponse {
        rpcs: instance.rpcs.names(),
        state: inspect_state(instance),
        connections: inspect_connections(instance),
    }
}

/// Answer an RPC sent over an inspector socket.
pub(crate) async fn execute_inspector_rpc(
    instance: &Arc<Instance>,
    conn: Arc<Connection>,
    name: &str,
    args: RpcArgs,
) -> anyhow::Result<Value> {
    match name {
        INSPECT_RPC => Ok(serde_json::to_value(inspect(instance))?),
        SET_STATE_RPC => {
            let value = args.raw(0).cloned().unwrap_or(Value::Null);
            StateHandle::new(instance.state.clone()).set(&value)?;
            instance.state.save_throttled();
            Ok(Value::Null)
        }
        _ => instance.execute_rpc(conn, name, args).await,
    }
}
