//! Runtime for hosting a single durable actor.
//!
//! An actor is declared with [`ActorBuilder`] and handed to [`run`] (or
//! [`run_with_cli`] from a binary). The runtime serves it over WebSocket and
//! one-shot HTTP, persists its state through a [`Kv`] store, and fans events
//! out to subscribed connections.

pub mod actor;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod inspect;
pub mod kv;
pub mod metadata;
pub mod rpc;
pub mod server;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub use crate::actor::{ActorBuilder, ActorContext, ActorDefinition, ActorInstance, ConnectRequest, Lifecycle};
pub use crate::config::{ActorConfig, RuntimeConfig};
pub use crate::connection::Connection;
pub use crate::error::ActorError;
pub use crate::kv::{FileKv, Kv, KvKey, MemoryKv};
pub use crate::metadata::ActorMetadata;
pub use crate::rpc::{RpcArgs, RpcContext};
pub use crate::state::StateHandle;

/// How long the HTTP server gets to wind down after the actor stops.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))?;
    Ok(())
}

/// Host `definition` using CLI args (parsed by the caller).
pub async fn run_with_cli(definition: ActorDefinition, cli: cli::Cli) -> Result<()> {
    init_tracing(cli.verbose)?;
    let cfg = RuntimeConfig::from_cli(&cli)?;
    run(definition, cfg).await
}

/// Host `definition` until ctrl-c or until the actor asks to stop.
///
/// The listener is bound before state is loaded; requests that arrive
/// early wait for the load.
pub async fn run(definition: ActorDefinition, cfg: RuntimeConfig) -> Result<()> {
    let kv: Arc<dyn Kv> = match &cfg.kv_path {
        Some(path) => Arc::new(FileKv::open(path).await?),
        None => {
            warn!("ACTOR_KV_PATH not set, state will not survive a restart");
            Arc::new(MemoryKv::new())
        }
    };

    let actor_config = cfg.apply(definition.config().clone());
    let definition = definition.with_config(actor_config);
    let name = definition.name().to_string();
    let actor = ActorInstance::new(definition, kv, cfg.metadata.clone());

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr()).await?;
    info!(addr = %cfg.listen_addr(), actor = %name, id = %cfg.metadata.actor_id, "actor listening");
    let mut server = tokio::spawn(server::serve(listener, actor.clone()));

    if let Err(err) = actor.boot().await {
        error!(?err, "actor failed to start");
        actor.shutdown().await;
        server.abort();
        return Err(err);
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("received ctrl-c");
        }
        _ = actor.shutdown_requested() => info!("actor requested shutdown"),
    }
    actor.shutdown().await;

    match tokio::time::timeout(SERVER_STOP_TIMEOUT, &mut server).await {
        Ok(Ok(result)) => result?,
        Ok(Err(err)) => error!(?err, "server task failed"),
        Err(_) => {
            warn!("server did not stop in time");
            server.abort();
        }
    }
    Ok(())
}
