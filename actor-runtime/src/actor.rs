//! The hosted actor: definition, lifecycle and the author-facing context.
//!
//! An actor is described once with [`ActorBuilder`] and hosted by exactly one
//! [`ActorInstance`] per process. Lifecycle:
//!
//! ```text
//! Booting → Initializing → Starting → Ready → ShuttingDown → Terminated
//! ```
//!
//! Requests arriving before state is loaded wait for it. Broadcasts,
//! background tasks, forced saves and `on_state_change` need `Ready`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use actor_protocol::{ws::ToClient, ProtocolFormat};
use axum::http::HeaderMap;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::{ActorConfig, BEFORE_CONNECT_TIMEOUT, ON_CONNECT_TIMEOUT, SHUTDOWN_DRAIN_TIMEOUT};
use crate::connection::{Connection, ConnectionId};
use crate::error::ActorError;
use crate::events::{fan_out, Registry};
use crate::inspect::Inspector;
use crate::kv::Kv;
use crate::metadata::ActorMetadata;
use crate::rpc::{is_callable_name, RpcArgs, RpcContext, RpcTable};
use crate::state::{to_state_value, StateEngine, StateFactory, StateHandle, StateObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Booting,
    Initializing,
    Starting,
    Ready,
    ShuttingDown,
    Terminated,
}

/// Handed to the before-connect hook.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Parsed `params` query value, `null` when absent.
    pub parameters: Value,
    pub headers: HeaderMap,
    pub format: ProtocolFormat,
}

type LifecycleHook = Arc<dyn Fn(ActorContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type BeforeConnectHook =
    Arc<dyn Fn(ActorContext, ConnectRequest) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type ConnectionHook =
    Arc<dyn Fn(ActorContext, Arc<Connection>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type StateChangeHook = Arc<dyn Fn(&ActorContext, &Value) -> anyhow::Result<()> + Send + Sync>;
type BeforeRpcResponseHook =
    Arc<dyn Fn(&ActorContext, &str, &RpcArgs, Value) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    on_initialize: Option<StateFactory>,
    on_start: Option<LifecycleHook>,
    on_before_connect: Option<BeforeConnectHook>,
    on_connect: Option<ConnectionHook>,
    on_disconnect: Option<ConnectionHook>,
    on_state_change: Option<StateChangeHook>,
    on_before_rpc_response: Option<BeforeRpcResponseHook>,
}

/// Collects hooks and RPCs into an [`ActorDefinition`].
pub struct ActorBuilder {
    name: String,
    hooks: Hooks,
    rpcs: RpcTable,
    config: ActorConfig,
}

impl ActorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hooks: Hooks::default(),
            rpcs: RpcTable::default(),
            config: ActorConfig::default(),
        }
    }

    pub fn config(mut self, config: ActorConfig) -> Self {
        self.config = config;
        self
    }

    /// Produce the initial state. Declaring this hook enables state; it runs
    /// once per store, on first boot.
    pub fn on_initialize<F, Fut, S>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
        S: Serialize + 'static,
    {
        self.hooks.on_initialize = Some(Arc::new(move || {
            let fut = f();
            Box::pin(async move {
                let initial = fut.await?;
                Ok(to_state_value(&initial, "")?)
            })
        }));
        self
    }

    /// Runs after state is loaded and before the actor is ready.
    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_start = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Admit or refuse a connection. The returned value becomes the
    /// connection state; declaring this hook enables connection state.
    pub fn on_before_connect<F, Fut, S>(mut self, f: F) -> Self
    where
        F: Fn(ActorContext, ConnectRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
        S: Serialize + 'static,
    {
        self.hooks.on_before_connect = Some(Arc::new(move |ctx, req| {
            let fut = f(ctx, req);
            Box::pin(async move {
                let conn_state = fut.await?;
                Ok(to_state_value(&conn_state, "")?)
            })
        }));
        self
    }

    /// Runs once a connection is registered, under a 5s deadline. Frames
    /// from that connection are not read until the hook returns; a failure
    /// or timeout disconnects it.
    pub fn on_connect<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActorContext, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_connect = Some(Arc::new(move |ctx, conn| Box::pin(f(ctx, conn))));
        self
    }

    pub fn on_disconnect<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActorContext, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.on_disconnect = Some(Arc::new(move |ctx, conn| Box::pin(f(ctx, conn))));
        self
    }

    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&ActorContext, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_state_change = Some(Arc::new(f));
        self
    }

    /// Rewrite an RPC's output before it is sent.
    pub fn on_before_rpc_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&ActorContext, &str, &RpcArgs, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.hooks.on_before_rpc_response = Some(Arc::new(f));
        self
    }

    /// Register an async RPC. It runs under the configured RPC timeout.
    pub fn rpc<F, Fut, O>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(RpcContext, RpcArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Serialize + 'static,
    {
        self.rpcs.insert_async(name, move |ctx, args| {
            let fut = f(ctx, args);
            async move { Ok(serde_json::to_value(fut.await?)?) }
        });
        self
    }

    /// Register a synchronous RPC.
    pub fn rpc_sync<F, O>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(RpcContext, RpcArgs) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Serialize + 'static,
    {
        self.rpcs
            .insert_sync(name, move |ctx, args| Ok(serde_json::to_value(f(ctx, args)?)?));
        self
    }

    pub fn build(self) -> ActorDefinition {
        for name in self.rpcs.registered_names() {
            if !is_callable_name(&name) {
                warn!(actor = %self.name, rpc = %name, "rpc name is private or reserved and will not be callable");
            }
        }
        ActorDefinition {
            name: self.name,
            hooks: self.hooks,
            rpcs: self.rpcs,
            config: self.config,
        }
    }
}

/// A fully described actor, ready to be hosted.
#[derive(Clone)]
pub struct ActorDefinition {
    name: String,
    hooks: Hooks,
    rpcs: RpcTable,
    config: ActorConfig,
}

impl ActorDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ActorConfig {
        &self.config
    }

    pub fn rpc_names(&self) -> Vec<String> {
        self.rpcs.names()
    }

    pub fn with_config(mut self, config: ActorConfig) -> Self {
        self.config = config;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct Instance {
    pub(crate) name: String,
    pub(crate) metadata: ActorMetadata,
    pub(crate) config: ActorConfig,
    hooks: Hooks,
    pub(crate) rpcs: RpcTable,
    pub(crate) state: Arc<StateEngine>,
    pub(crate) registry: Registry,
    pub(crate) inspector: Inspector,
    lifecycle: watch::Sender<Lifecycle>,
    shutdown_requested: Notify,
    shutdown_started: AtomicBool,
}

/// Relays state changes to the inspector and the author's hook.
struct StateChangeRelay {
    instance: Weak<Instance>,
}

impl StateObserver for StateChangeRelay {
    fn state_changed(&self, state: &Value) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        instance.inspector.state_changed();

        if !instance.is_ready() {
            return;
        }
        if let Some(hook) = &instance.hooks.on_state_change {
            let ctx = ActorContext::new(instance.clone());
            if let Err(err) = hook(&ctx, state) {
                error!(?err, "on_state_change failed");
            }
        }
    }
}

impl Instance {
    fn new(definition: ActorDefinition, kv: Arc<dyn Kv>, metadata: ActorMetadata) -> Arc<Self> {
        let ActorDefinition {
            name,
            hooks,
            rpcs,
            config,
        } = definition;

        Arc::new_cyclic(|weak| {
            let observer: Arc<dyn StateObserver> = Arc::new(StateChangeRelay {
                instance: weak.clone(),
            });
            let state = StateEngine::new(
                kv,
                hooks.on_initialize.clone(),
                config.state.save_interval,
                Some(observer),
            );

            Instance {
                name,
                metadata,
                config,
                hooks,
                rpcs,
                state: Arc::new(state),
                registry: Registry::new(),
                inspector: Inspector::new(weak.clone()),
                lifecycle: watch::channel(Lifecycle::Booting).0,
                shutdown_requested: Notify::new(),
                shutdown_started: AtomicBool::new(false),
            }
        })
    }

    pub(crate) fn context(self: &Arc<Self>) -> ActorContext {
        ActorContext::new(self.clone())
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        let prev = self.lifecycle.send_replace(next);
        debug!(?prev, ?next, "lifecycle transition");
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.lifecycle() >= Lifecycle::ShuttingDown
    }

    fn assert_ready(&self) -> Result<(), ActorError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ActorError::internal("actor not ready"))
        }
    }

    /// Wait for the one state load. Fails if the actor stops first.
    pub(crate) async fn wait_until_loaded(&self) -> Result<(), ActorError> {
        let mut rx = self.lifecycle.subscribe();
        let reached = match rx.wait_for(|stage| *stage >= Lifecycle::Starting).await {
            Ok(stage) => *stage,
            Err(_) => Lifecycle::Terminated,
        };
        if reached >= Lifecycle::ShuttingDown {
            return Err(ActorError::internal("actor is not running"));
        }
        Ok(())
    }

    async fn boot(self: &Arc<Self>) -> anyhow::Result<()> {
        self.set_lifecycle(Lifecycle::Initializing);
        if let Err(err) = self.state.load().await {
            self.set_lifecycle(Lifecycle::ShuttingDown);
            return Err(err.context("failed to load actor state"));
        }

        self.set_lifecycle(Lifecycle::Starting);
        if let Some(hook) = &self.hooks.on_start {
            if let Err(err) = hook(self.context()).await {
                self.set_lifecycle(Lifecycle::ShuttingDown);
                return Err(err.context("on_start failed"));
            }
        }

        self.set_lifecycle(Lifecycle::Ready);
        info!(actor = %self.name, id = %self.metadata.actor_id, "actor ready");
        Ok(())
    }

    // ── connections ─────────────────────────────────────────────────────────

    pub(crate) fn connection_state_enabled(&self) -> bool {
        self.hooks.on_before_connect.is_some()
    }

    /// Run the before-connect hook, if any. `Ok(None)` means connection
    /// state is disabled.
    pub(crate) async fn before_connect(
        self: &Arc<Self>,
        request: ConnectRequest,
    ) -> anyhow::Result<Option<Value>> {
        let Some(hook) = &self.hooks.on_before_connect else {
            return Ok(None);
        };
        match tokio::time::timeout(BEFORE_CONNECT_TIMEOUT, hook(self.context(), request)).await {
            Ok(result) => result.map(Some),
            Err(_) => Err(ActorError::internal("before-connect hook timed out").into()),
        }
    }

    /// Register a connection and run the on-connect hook. A failing hook
    /// removes the connection again.
    pub(crate) async fn accept_connection(self: &Arc<Self>, conn: Arc<Connection>) -> anyhow::Result<()> {
        self.registry.insert(conn.clone());
        debug!(conn = conn.id(), format = %conn.format(), "connection registered");
        self.inspector.connections_changed();

        let Some(hook) = &self.hooks.on_connect else {
            return Ok(());
        };
        let err = match tokio::time::timeout(ON_CONNECT_TIMEOUT, hook(self.context(), conn.clone())).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err,
            Err(_) => ActorError::internal("on-connect hook timed out").into(),
        };

        warn!(conn = conn.id(), ?err, "on_connect failed, disconnecting");
        conn.disconnect(Some("connect hook failed".to_string()));
        self.remove_connection(conn.id()).await;
        Err(err)
    }

    /// Forget a connection and run the disconnect hook. Idempotent.
    pub(crate) async fn remove_connection(self: &Arc<Self>, id: ConnectionId) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        debug!(conn = id, "connection removed");
        self.inspector.connections_changed();

        if let Some(hook) = &self.hooks.on_disconnect {
            if let Err(err) = hook(self.context(), conn).await {
                error!(conn = id, ?err, "on_disconnect failed");
            }
        }
    }

    pub(crate) fn subscribe(&self, id: ConnectionId, event: &str, subscribe: bool) {
        let changed = if subscribe {
            self.registry.subscribe(id, event)
        } else {
            self.registry.unsubscribe(id, event)
        };
        if changed {
            self.inspector.connections_changed();
        }
    }

    // ── rpc ─────────────────────────────────────────────────────────────────

    /// Dispatch an RPC from `conn`, apply the response hook, then queue a
    /// throttled save whatever the outcome.
    pub(crate) async fn execute_rpc(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        name: &str,
        args: RpcArgs,
    ) -> anyhow::Result<Value> {
        let ctx = RpcContext::new(self.context(), conn.clone());
        let hook_args = self.hooks.on_before_rpc_response.as_ref().map(|_| args.clone());

        let result = self
            .rpcs
            .call(name, ctx, args, self.config.rpc.timeout)
            .await
            .and_then(|output| match (&self.hooks.on_before_rpc_response, &hook_args) {
                (Some(hook), Some(args)) => hook(&self.context(), name, args, output),
                _ => Ok(output),
            });

        if self.state.enabled() {
            self.state.save_throttled();
        }

        if let Err(err) = &result {
            match err.downcast_ref::<ActorError>() {
                Some(actor_err) if actor_err.is_public() => {
                    debug!(rpc = %name, conn = conn.id(), code = actor_err.code(), "rpc failed");
                }
                _ => error!(rpc = %name, conn = conn.id(), ?err, "rpc failed with internal error"),
            }
        }
        result
    }

    // ── events ──────────────────────────────────────────────────────────────

    fn broadcast(&self, event: &str, args: Vec<Value>) -> Result<(), ActorError> {
        self.assert_ready()?;
        self.inspector.event_emitted(event);

        let subscribers = self.registry.subscribers(event);
        if subscribers.is_empty() {
            return Ok(());
        }
        let message = ToClient::event(event, args);
        let delivered = fan_out(&subscribers, &message, |msg, format| {
            actor_protocol::encode(msg, format)
        });
        debug!(event, delivered, "broadcast");
        Ok(())
    }

    // ── shutdown ────────────────────────────────────────────────────────────

    pub(crate) async fn terminated(&self) {
        let mut rx = self.lifecycle.subscribe();
        let _ = rx.wait_for(|stage| *stage == Lifecycle::Terminated).await;
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown_requested.notify_one();
    }

    pub(crate) async fn shutdown_requested(&self) {
        self.shutdown_requested.notified().await
    }

    /// Close persistent connections, flush state, and stop.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.terminated().await;
            return;
        }
        self.set_lifecycle(Lifecycle::ShuttingDown);
        info!(actor = %self.name, "shutting down");

        let persistent: Vec<Arc<Connection>> = self
            .registry
            .all()
            .into_iter()
            .chain(self.inspector.connections())
            .filter(|conn| conn.is_persistent())
            .collect();
        for conn in &persistent {
            conn.disconnect(Some("actor shutting down".to_string()));
        }
        let drained = join_all(persistent.iter().map(|conn| conn.closed()));
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drained).await.is_err() {
            warn!("timed out waiting for connections to close, shutting down anyway");
        }

        if let Err(err) = self.state.save(true).await {
            error!(?err, "final state save failed");
        }

        self.set_lifecycle(Lifecycle::Terminated);
        info!(actor = %self.name, "actor terminated");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the hosted actor. Cloning shares the same instance.
#[derive(Clone)]
pub struct ActorInstance {
    inner: Arc<Instance>,
}

impl ActorInstance {
    /// Must be called from within a Tokio runtime.
    pub fn new(definition: ActorDefinition, kv: Arc<dyn Kv>, metadata: ActorMetadata) -> Self {
        Self {
            inner: Instance::new(definition, kv, metadata),
        }
    }

    pub fn context(&self) -> ActorContext {
        self.inner.context()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    /// Load state, run `on_start`, and mark the actor ready.
    pub async fn boot(&self) -> anyhow::Result<()> {
        self.inner.boot().await
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    /// Resolves once the actor has fully stopped.
    pub async fn terminated(&self) {
        self.inner.terminated().await
    }

    /// Resolves when actor code asks for a shutdown.
    pub async fn shutdown_requested(&self) {
        self.inner.shutdown_requested().await
    }

    pub(crate) fn inner(&self) -> &Arc<Instance> {
        &self.inner
    }
}

/// The actor as seen from hooks and RPC handlers.
#[derive(Clone)]
pub struct ActorContext {
    instance: Arc<Instance>,
}

impl ActorContext {
    fn new(instance: Arc<Instance>) -> Self {
        Self { instance }
    }

    pub fn state(&self) -> StateHandle {
        StateHandle::new(self.instance.state.clone())
    }

    pub fn metadata(&self) -> &ActorMetadata {
        &self.instance.metadata
    }

    pub fn kv(&self) -> Arc<dyn Kv> {
        self.instance.state.kv()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.instance.registry.all()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.instance.registry.get(id)
    }

    /// Send an event to every subscribed connection.
    pub fn broadcast(&self, event: &str, args: Vec<Value>) -> Result<(), ActorError> {
        self.instance.broadcast(event, args)
    }

    /// Spawn work that outlives the current request. Failures are logged.
    pub fn run_in_background<F>(&self, fut: F) -> Result<(), ActorError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.instance.assert_ready()?;
        tokio::spawn(async move {
            match fut.await {
                Ok(()) => debug!("background task complete"),
                Err(err) => error!(?err, "background task failed"),
            }
        });
        Ok(())
    }

    /// Persist state if it changed. `immediate` skips the throttle.
    pub async fn save_state(&self, immediate: bool) -> anyhow::Result<()> {
        self.instance.assert_ready()?;
        self.instance.state.save(immediate).await?;
        Ok(())
    }

    /// Ask the host to shut the actor down.
    pub fn shutdown(&self) {
        self.instance.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HttpTransport;
    use crate::kv::MemoryKv;
    use serde_json::json;
    use std::time::Duration;

    fn counter() -> ActorBuilder {
        ActorBuilder::new("counter")
            .on_initialize(|| async { Ok(json!({"count": 0})) })
            .rpc("increment", |ctx, args| async move {
                let by: i64 = args.get(0)?;
                let count = ctx.state().update(|s| {
                    let next = s["count"].as_i64().unwrap_or(0) + by;
                    s["count"] = json!(next);
                    next
                })?;
                Ok(count)
            })
            .rpc("slow", |_ctx, _args| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })
            .rpc_sync("getCount", |ctx, _args| {
                Ok(ctx.state().read(|s| s["count"].clone())?)
            })
    }

    fn http_conn() -> Arc<Connection> {
        Arc::new(Connection::new(ProtocolFormat::Json, None, Arc::new(HttpTransport::new())))
    }

    #[tokio::test]
    async fn test_boot_reaches_ready() {
        let instance = ActorInstance::new(counter().build(), Arc::new(MemoryKv::new()), ActorMetadata::default());
        assert_eq!(instance.lifecycle(), Lifecycle::Booting);
        instance.boot().await.unwrap();
        assert_eq!(instance.lifecycle(), Lifecycle::Ready);
    }

    #[tokio::test]
    async fn test_broadcast_requires_ready() {
        let instance = ActorInstance::new(counter().build(), Arc::new(MemoryKv::new()), ActorMetadata::default());
        let err = instance.context().broadcast("changed", vec![]).unwrap_err();
        assert_eq!(err.code(), "internal_error");
        assert!(instance.context().run_in_background(async { Ok(()) }).is_err());
    }

    #[tokio::test]
    async fn test_failed_load_aborts_boot() {
        let def = ActorBuilder::new("broken")
            .on_initialize(|| async { Err::<Value, _>(anyhow::anyhow!("no initial state")) })
            .build();
        let instance = ActorInstance::new(def, Arc::new(MemoryKv::new()), ActorMetadata::default());
        assert!(instance.boot().await.is_err());
        assert!(instance.inner().wait_until_loaded().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_timeout_leaves_actor_usable() {
        let config = ActorConfig {
            rpc: crate::config::RpcConfig {
                timeout: Duration::from_millis(100),
            },
            ..ActorConfig::default()
        };
        let instance = ActorInstance::new(
            counter().config(config).build(),
            Arc::new(MemoryKv::new()),
            ActorMetadata::default(),
        );
        instance.boot().await.unwrap();
        let inner = instance.inner();
        let conn = http_conn();

        let err = inner
            .execute_rpc(conn.clone(), "slow", RpcArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ActorError>(), Some(ActorError::RpcTimedOut)));

        let out = inner
            .execute_rpc(conn, "increment", RpcArgs::new(vec![json!(2)]))
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }

    #[tokio::test]
    async fn test_private_rpc_not_callable_even_if_registered() {
        let def = counter()
            .rpc_sync("_secret", |_, _| Ok("leaked"))
            .rpc_sync("constructor", |_, _| Ok("leaked"))
            .build();
        let instance = ActorInstance::new(def, Arc::new(MemoryKv::new()), ActorMetadata::default());
        instance.boot().await.unwrap();

        for name in ["_secret", "constructor", "#private", "nope"] {
            let err = instance
                .inner()
                .execute_rpc(http_conn(), name, RpcArgs::default())
                .await
                .unwrap_err();
            assert!(matches!(err.downcast_ref::<ActorError>(), Some(ActorError::RpcNotFound)));
        }
    }

    #[tokio::test]
    async fn test_before_rpc_response_rewrites_output() {
        let def = counter()
            .on_before_rpc_response(|_, name, _, output| Ok(json!({ "rpc": name, "output": output })))
            .build();
        let instance = ActorInstance::new(def, Arc::new(MemoryKv::new()), ActorMetadata::default());
        instance.boot().await.unwrap();

        let out = instance
            .inner()
            .execute_rpc(http_conn(), "getCount", RpcArgs::default())
            .await
            .unwrap();
        assert_eq!(out, json!({"rpc": "getCount", "output": 0}));
    }

    #[tokio::test]
    async fn test_state_change_hook_only_after_ready() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let def = counter()
            .on_start(|ctx| async move {
                ctx.state().set(&json!({"count": 100}))?;
                Ok(())
            })
            .on_state_change(move |_, state| {
                recorder.lock().push(state.clone());
                Ok(())
            })
            .build();
        let instance = ActorInstance::new(def, Arc::new(MemoryKv::new()), ActorMetadata::default());
        instance.boot().await.unwrap();
        assert!(seen.lock().is_empty(), "hook must not run before ready");

        instance
            .inner()
            .execute_rpc(http_conn(), "increment", RpcArgs::new(vec![json!(1)]))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec![json!({"count": 101})]);
    }

    #[tokio::test]
    async fn test_connect_hook_failure_removes_connection() {
        let disconnects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter_ref = disconnects.clone();
        let def = counter()
            .on_connect(|_, _| async { Err(anyhow::anyhow!("go away")) })
            .on_disconnect(move |_, _| {
                let counter_ref = counter_ref.clone();
                async move {
                    counter_ref.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();
        let instance = ActorInstance::new(def, Arc::new(MemoryKv::new()), ActorMetadata::default());
        instance.boot().await.unwrap();

        let conn = http_conn();
        assert!(instance.inner().accept_connection(conn.clone()).await.is_err());
        assert!(instance.context().connection(conn.id()).is_none());
        assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Removing again is a no-op.
        instance.inner().remove_connection(conn.id()).await;
        assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_waits_for_connect_hook() {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = finished.clone();
        let def = counter()
            .on_connect(move |_, _| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();
        let instance = ActorInstance::new(def, Arc::new(MemoryKv::new()), ActorMetadata::default());
        instance.boot().await.unwrap();

        let conn = http_conn();
        instance.inner().accept_connection(conn.clone()).await.unwrap();
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
        assert!(instance.context().connection(conn.id()).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_state() {
        let kv = Arc::new(MemoryKv::new());
        let instance = ActorInstance::new(counter().build(), kv.clone(), ActorMetadata::default());
        instance.boot().await.unwrap();
        instance.context().state().set(&json!({"count": 9})).unwrap();

        instance.shutdown().await;
        assert_eq!(instance.lifecycle(), Lifecycle::Terminated);
        assert_eq!(
            kv.snapshot().get(&crate::state::keys::data()),
            Some(&json!({"count": 9}))
        );
    }
}
