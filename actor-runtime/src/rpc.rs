//! RPC method table and dispatch.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::actor::ActorContext;
use crate::connection::Connection;
use crate::error::ActorError;
use crate::state::StateHandle;

/// Names that can never be called remotely, even when registered.
const RESERVED_NAMES: &[&str] = &[
    "constructor",
    "initialize",
    "run",
    "on_initialize",
    "on_start",
    "on_state_change",
    "on_before_connect",
    "on_connect",
    "on_disconnect",
    "on_before_rpc_response",
    "onInitialize",
    "onStart",
    "onStateChange",
    "onBeforeConnect",
    "onConnect",
    "onDisconnect",
    "onBeforeRpcResponse",
];

const PRIVATE_PREFIXES: &[&str] = &["#", "_", "internal_"];

/// Whether `name` may be exposed as an RPC at all.
pub fn is_callable_name(name: &str) -> bool {
    !name.is_empty()
        && !PRIVATE_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
        && !RESERVED_NAMES.contains(&name)
}

/// Positional RPC arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcArgs(Vec<Value>);

impl RpcArgs {
    pub fn new(args: Vec<Value>) -> Self {
        Self(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn raw(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    /// Deserialize a required argument.
    pub fn get<T: DeserializeOwned>(&self, idx: usize) -> Result<T, ActorError> {
        let value = self.0.get(idx).ok_or_else(|| {
            ActorError::user("invalid_arguments", format!("missing argument {idx}"))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ActorError::user("invalid_arguments", format!("invalid argument {idx}: {e}"))
        })
    }

    /// Deserialize an optional argument; absent and `null` both yield `None`.
    pub fn optional<T: DeserializeOwned>(&self, idx: usize) -> Result<Option<T>, ActorError> {
        match self.0.get(idx) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(idx).map(Some),
        }
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for RpcArgs {
    fn from(args: Vec<Value>) -> Self {
        Self(args)
    }
}

/// What an RPC handler sees: the actor plus the calling connection.
#[derive(Clone)]
pub struct RpcContext {
    actor: ActorContext,
    connection: Arc<Connection>,
}

impl RpcContext {
    pub(crate) fn new(actor: ActorContext, connection: Arc<Connection>) -> Self {
        Self { actor, connection }
    }

    pub fn actor(&self) -> &ActorContext {
        &self.actor
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> StateHandle {
        self.actor.state()
    }
}

pub(crate) type AsyncHandler =
    Arc<dyn Fn(RpcContext, RpcArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub(crate) type SyncHandler = Arc<dyn Fn(RpcContext, RpcArgs) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum RpcHandler {
    Async(AsyncHandler),
    Sync(SyncHandler),
}

/// Static method table, built once by the actor builder.
#[derive(Clone, Default)]
pub struct RpcTable {
    handlers: BTreeMap<String, RpcHandler>,
}

impl RpcTable {
    pub(crate) fn insert_async<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(RpcContext, RpcArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |ctx, args| Box::pin(handler(ctx, args)));
        self.handlers
            .insert(name.to_string(), RpcHandler::Async(handler));
    }

    pub(crate) fn insert_sync<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(RpcContext, RpcArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers
            .insert(name.to_string(), RpcHandler::Sync(Arc::new(handler)));
    }

    /// Callable names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.handlers
            .keys()
            .filter(|name| is_callable_name(name))
            .cloned()
            .collect()
    }

    /// Every registered name, callable or not.
    pub(crate) fn registered_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub(crate) fn resolve(&self, name: &str) -> Result<&RpcHandler, ActorError> {
        if !is_callable_name(name) {
            return Err(ActorError::RpcNotFound);
        }
        self.handlers.get(name).ok_or(ActorError::RpcNotFound)
    }

    /// Run one RPC. Async handlers race `timeout`; sync handlers return
    /// directly.
    pub async fn call(
        &self,
        name: &str,
        ctx: RpcContext,
        args: RpcArgs,
        timeout: Duration,
    ) -> anyhow::Result<Value> {
        match self.resolve(name)? {
            RpcHandler::Sync(handler) => handler(ctx, args),
            RpcHandler::Async(handler) => {
                let fut = handler(ctx, args);
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ActorError::RpcTimedOut.into()),
                }
            }
        }
    }
}
