//! Persisted actor state.
//!
//! The engine owns the state value. Reads and writes go through
//! [`StateHandle`], whose mutators validate the incoming value before it is
//! applied, mark the state dirty, and notify the [`StateObserver`]. Storage
//! writes happen on a single saver task that implements the throttle:
//!
//! ```text
//!   Idle ──throttled, interval elapsed──▶ Saving ──▶ Idle
//!    │                                      ▲
//!    └──throttled, within interval──▶ Pending(fire_at) ──timer──┘
//! ```
//!
//! Repeated throttled requests while `Pending` coalesce into the one trailing
//! save. The dirty flag is cleared before the write is issued, so mutations
//! that land during a write are picked up by the next save.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::ActorError;
use crate::kv::{Kv, KvError, KvKey};

pub(crate) mod keys {
    use crate::kv::KvKey;

    pub fn initialized() -> KvKey {
        KvKey::new(["actor", "state", "initialized"])
    }

    pub fn data() -> KvKey {
        KvKey::new(["actor", "state", "data"])
    }
}

/// Produces the initial state the first time an actor boots.
pub type StateFactory = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Notified after every change to the state value.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, state: &Value);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SaveError {
    #[error(transparent)]
    Storage(Arc<KvError>),

    #[error("state saver is not running")]
    SaverStopped,
}

// ─────────────────────────────────────────────────────────────────────────────
// Serializability
// ─────────────────────────────────────────────────────────────────────────────

/// Convert `value` into a JSON tree, rejecting anything JSON cannot carry.
///
/// Accepts null, booleans, finite numbers, strings, arrays and string-keyed
/// maps. Non-finite floats, byte strings, tagged values, non-string map keys
/// and failing `Serialize` impls are reported with the JSON pointer of the
/// offending value, prefixed with `base`.
pub fn to_state_value<T>(value: &T, base: &str) -> Result<Value, ActorError>
where
    T: Serialize + ?Sized,
{
    let raw = ciborium::value::Value::serialized(value).map_err(|_| ActorError::InvalidStateType {
        path: base.to_string(),
    })?;
    convert(raw, &mut base.to_string())
}

fn convert(raw: ciborium::value::Value, path: &mut String) -> Result<Value, ActorError> {
    use ciborium::value::Value as Cbor;

    let invalid = |path: &str| ActorError::InvalidStateType {
        path: path.to_string(),
    };

    match raw {
        Cbor::Null => Ok(Value::Null),
        Cbor::Bool(b) => Ok(Value::Bool(b)),
        Cbor::Text(s) => Ok(Value::String(s)),
        Cbor::Integer(int) => {
            let wide = i128::from(int);
            if let Ok(n) = u64::try_from(wide) {
                Ok(Value::Number(Number::from(n)))
            } else if let Ok(n) = i64::try_from(wide) {
                Ok(Value::Number(Number::from(n)))
            } else {
                Err(invalid(path))
            }
        }
        Cbor::Float(f) => Number::from_f64(f).map(Value::Number).ok_or_else(|| invalid(path)),
        Cbor::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, item) in items.into_iter().enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&idx.to_string());
                out.push(convert(item, path)?);
                path.truncate(len);
            }
            Ok(Value::Array(out))
        }
        Cbor::Map(entries) => {
            let mut out = Map::new();
            for (key, item) in entries {
                let Cbor::Text(key) = key else {
                    return Err(invalid(path));
                };
                let len = path.len();
                path.push('/');
                path.push_str(&escape_pointer_token(&key));
                let item = convert(item, path)?;
                path.truncate(len);
                out.insert(key, item);
            }
            Ok(Value::Object(out))
        }
        _ => Err(invalid(path)),
    }
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StateSlot {
    /// `None` until loaded, and forever when state is disabled.
    value: Option<Value>,
    dirty: bool,
}

struct Shared {
    kv: Arc<dyn Kv>,
    slot: Mutex<StateSlot>,
}

impl Shared {
    /// Write the current value if it changed since the last write.
    async fn write_if_dirty(&self) -> Result<bool, KvError> {
        let snapshot = {
            let mut slot = self.slot.lock();
            if !slot.dirty {
                return Ok(false);
            }
            slot.dirty = false;
            slot.value.clone()
        };
        let Some(value) = snapshot else {
            return Ok(false);
        };

        debug!("saving state");
        if let Err(err) = self.kv.put(keys::data(), value).await {
            // Keep the change queued for the next attempt.
            self.slot.lock().dirty = true;
            return Err(err);
        }
        debug!("state saved");
        Ok(true)
    }
}

pub struct StateEngine {
    shared: Arc<Shared>,
    factory: Option<StateFactory>,
    observer: Option<Arc<dyn StateObserver>>,
    commands: mpsc::UnboundedSender<SaveCommand>,
}

impl StateEngine {
    /// Create the engine and spawn its saver task.
    ///
    /// Must be called from within a Tokio runtime. State is enabled iff a
    /// `factory` is given.
    pub fn new(
        kv: Arc<dyn Kv>,
        factory: Option<StateFactory>,
        save_interval: Duration,
        observer: Option<Arc<dyn StateObserver>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            kv,
            slot: Mutex::new(StateSlot::default()),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Saver {
                shared: shared.clone(),
                interval: save_interval,
                last_save: None,
                phase: SavePhase::Idle,
                waiters: Vec::new(),
            }
            .run(rx),
        );

        Self {
            shared,
            factory,
            observer,
            commands,
        }
    }

    pub fn enabled(&self) -> bool {
        self.factory.is_some()
    }

    pub fn kv(&self) -> Arc<dyn Kv> {
        self.shared.kv.clone()
    }

    /// Load the persisted state, running the factory on first boot.
    pub async fn load(&self) -> anyhow::Result<()> {
        let Some(factory) = &self.factory else {
            debug!("state not enabled");
            return Ok(());
        };

        let mut batch = self
            .shared
            .kv
            .get_batch(&[keys::initialized(), keys::data()])
            .await?;
        let initialized = batch
            .get(&keys::initialized())
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let value = if initialized {
            debug!("state already initialized");
            batch.remove(&keys::data()).unwrap_or(Value::Null)
        } else {
            info!("initializing state");
            let value = factory().await?;
            debug!("writing initial state");
            self.shared
                .kv
                .put_batch(vec![
                    (keys::initialized(), Value::Bool(true)),
                    (keys::data(), value.clone()),
                ])
                .await?;
            value
        };

        let mut slot = self.shared.slot.lock();
        slot.value = Some(value);
        slot.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.slot.lock().dirty
    }

    pub fn get(&self) -> Result<Value, ActorError> {
        self.read(Value::clone)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> Result<R, ActorError> {
        self.ensure_enabled()?;
        let slot = self.shared.slot.lock();
        let value = slot
            .value
            .as_ref()
            .ok_or_else(|| ActorError::internal("state read before load"))?;
        Ok(f(value))
    }

    /// Apply `f` to the state. Only the mutation runs under the lock; the
    /// observer is notified after it is released.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Value) -> Result<R, ActorError>,
    ) -> Result<R, ActorError> {
        self.ensure_enabled()?;
        let (out, snapshot) = {
            let mut slot = self.shared.slot.lock();
            let value = slot
                .value
                .as_mut()
                .ok_or_else(|| ActorError::internal("state written before load"))?;
            let out = f(value)?;
            let snapshot = self.observer.as_ref().map(|_| value.clone());
            slot.dirty = true;
            (out, snapshot)
        };

        if let (Some(observer), Some(snapshot)) = (&self.observer, snapshot) {
            observer.state_changed(&snapshot);
        }
        Ok(out)
    }

    /// Ask the saver for a throttled save. Never blocks.
    pub fn save_throttled(&self) {
        if self.commands.send(SaveCommand::Throttled).is_err() {
            error!("state saver stopped, dropping save request");
        }
    }

    /// Save if dirty. `immediate` writes now; otherwise waits for the next
    /// throttled save to resolve.
    pub async fn save(&self, immediate: bool) -> Result<(), SaveError> {
        if !self.is_dirty() {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let cmd = if immediate {
            SaveCommand::Immediate(tx)
        } else {
            SaveCommand::WaitForSave(tx)
        };
        self.commands.send(cmd).map_err(|_| SaveError::SaverStopped)?;
        rx.await.map_err(|_| SaveError::SaverStopped)?
    }

    fn ensure_enabled(&self) -> Result<(), ActorError> {
        if self.enabled() {
            Ok(())
        } else {
            Err(ActorError::StateNotEnabled)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Saver task
// ─────────────────────────────────────────────────────────────────────────────

type SaveReply = oneshot::Sender<Result<(), SaveError>>;

enum SaveCommand {
    Throttled,
    /// Throttled save, resolved once it has been written.
    WaitForSave(SaveReply),
    Immediate(SaveReply),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SavePhase {
    Idle,
    Pending { fire_at: Instant },
    Saving,
}

struct Saver {
    shared: Arc<Shared>,
    interval: Duration,
    last_save: Option<Instant>,
    phase: SavePhase,
    waiters: Vec<SaveReply>,
}

impl Saver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SaveCommand>) {
        loop {
            let fire_at = match self.phase {
                SavePhase::Pending { fire_at } => Some(fire_at),
                SavePhase::Idle | SavePhase::Saving => None,
            };

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(fire_at.unwrap_or_else(Instant::now)), if fire_at.is_some() => {
                    self.flush().await;
                }
            }
        }
        debug!("state saver stopped");
    }

    async fn handle(&mut self, cmd: SaveCommand) {
        match cmd {
            SaveCommand::Throttled => self.throttled().await,
            SaveCommand::WaitForSave(reply) => {
                self.waiters.push(reply);
                self.throttled().await;
            }
            SaveCommand::Immediate(reply) => {
                let result = self.flush().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn throttled(&mut self) {
        let now = Instant::now();
        match self.last_save {
            Some(last) if now.duration_since(last) < self.interval => {
                if self.phase == SavePhase::Idle {
                    self.phase = SavePhase::Pending {
                        fire_at: last + self.interval,
                    };
                }
            }
            _ => {
                self.flush().await;
            }
        }
    }

    async fn flush(&mut self) -> Result<(), SaveError> {
        self.phase = SavePhase::Saving;
        self.last_save = Some(Instant::now());

        let result = match self.shared.write_if_dirty().await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(?err, "failed to save state");
                Err(SaveError::Storage(Arc::new(err)))
            }
        };

        self.phase = SavePhase::Idle;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// The sanctioned way for actor code to read and change state.
///
/// Every mutator validates the new value first, so a rejected write leaves
/// the state exactly as it was.
#[derive(Clone)]
pub struct StateHandle {
    engine: Arc<StateEngine>,
}

impl StateHandle {
    pub(crate) fn new(engine: Arc<StateEngine>) -> Self {
        Self { engine }
    }

    pub fn enabled(&self) -> bool {
        self.engine.enabled()
    }

    pub fn get(&self) -> Result<Value, ActorError> {
        self.engine.get()
    }

    /// Deserialize the state into a typed view.
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T, ActorError> {
        let value = self.engine.get()?;
        serde_json::from_value(value)
            .map_err(|e| ActorError::internal(format!("state does not match requested type: {e}")))
    }

    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> Result<R, ActorError> {
        self.engine.read(f)
    }

    /// Replace the whole state.
    pub fn set<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ActorError> {
        let value = to_state_value(value, "")?;
        self.engine.mutate(|state| {
            *state = value;
            Ok(())
        })
    }

    /// Mutate the JSON tree in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut Value) -> R) -> Result<R, ActorError> {
        self.engine.mutate(|state| Ok(f(state)))
    }

    /// Set the value at a JSON pointer. The parent must exist; on arrays the
    /// last token is an index or `-` to append.
    pub fn set_path<T: Serialize + ?Sized>(&self, pointer: &str, value: &T) -> Result<(), ActorError> {
        let value = to_state_value(value, pointer)?;
        self.engine.mutate(|state| {
            if pointer.is_empty() {
                *state = value;
                return Ok(());
            }
            let (parent, token) = split_pointer(pointer)?;
            match state.pointer_mut(parent) {
                Some(Value::Object(map)) => {
                    map.insert(token, value);
                    Ok(())
                }
                Some(Value::Array(items)) => {
                    if token == "-" {
                        items.push(value);
                        return Ok(());
                    }
                    let idx = parse_index(&token, pointer)?;
                    if idx < items.len() {
                        items[idx] = value;
                        Ok(())
                    } else if idx == items.len() {
                        items.push(value);
                        Ok(())
                    } else {
                        Err(missing_path(pointer))
                    }
                }
                _ => Err(missing_path(pointer)),
            }
        })
    }

    /// Append to the array at a JSON pointer.
    pub fn push_path<T: Serialize + ?Sized>(&self, pointer: &str, value: &T) -> Result<(), ActorError> {
        let base = format!("{pointer}/-");
        let value = to_state_value(value, &base)?;
        self.engine.mutate(|state| match state.pointer_mut(pointer) {
            Some(Value::Array(items)) => {
                items.push(value);
                Ok(())
            }
            _ => Err(missing_path(pointer)),
        })
    }

    /// Remove the value at a JSON pointer, returning it if it existed.
    pub fn remove_path(&self, pointer: &str) -> Result<Option<Value>, ActorError> {
        let (parent, token) = split_pointer(pointer)?;
        self.engine.mutate(|state| {
            let removed = match state.pointer_mut(parent) {
                Some(Value::Object(map)) => map.remove(&token),
                Some(Value::Array(items)) => match token.parse::<usize>() {
                    Ok(idx) if idx < items.len() => Some(items.remove(idx)),
                    _ => None,
                },
                _ => None,
            };
            Ok(removed)
        })
    }
}

fn split_pointer(pointer: &str) -> Result<(&str, String), ActorError> {
    if !pointer.starts_with('/') {
        return Err(ActorError::internal(format!(
            "invalid state path `{pointer}`: must be a JSON pointer"
        )));
    }
    // `rsplit_once` cannot fail after the check above.
    let (parent, token) = pointer.rsplit_once('/').unwrap_or(("", pointer));
    Ok((parent, unescape_pointer_token(token)))
}

fn parse_index(token: &str, pointer: &str) -> Result<usize, ActorError> {
    token.parse::<usize>().map_err(|_| missing_path(pointer))
}

fn missing_path(pointer: &str) -> ActorError {
    ActorError::internal(format!("state path `{pointer}` does not exist"))
}
