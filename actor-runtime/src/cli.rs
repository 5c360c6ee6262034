use std::path::PathBuf;

use clap::Parser;

/// CLI for the actor host. Every flag can also come from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "actor-host", about = "Hosts a single durable actor over WebSocket and HTTP")]
pub struct Cli {
    /// Port for HTTP/WS endpoints
    #[arg(long, env = "PORT_HTTP")]
    pub port: Option<String>,

    /// Host to bind
    #[arg(long, env = "ACTOR_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Actor id (random when unset)
    #[arg(long, env = "ACTOR_ID")]
    pub actor_id: Option<String>,

    /// Base URL of the operator dashboard, attached to internal errors
    #[arg(long, env = "ACTOR_DEBUG_URL")]
    pub debug_url: Option<String>,

    /// JSON file backing the KV store; in-memory when unset
    #[arg(long, env = "ACTOR_KV_PATH")]
    pub kv_path: Option<PathBuf>,

    // ─────────────────────────────────────────────────────────────────────────
    // Tunables (override the actor's own config when set)
    // ─────────────────────────────────────────────────────────────────────────

    /// Minimum interval between state writes, in milliseconds
    #[arg(long, env = "ACTOR_STATE_SAVE_INTERVAL_MS")]
    pub save_interval_ms: Option<u64>,

    /// Deadline for async RPC handlers, in milliseconds
    #[arg(long, env = "ACTOR_RPC_TIMEOUT_MS")]
    pub rpc_timeout_ms: Option<u64>,

    /// Largest accepted `params` query value, in bytes
    #[arg(long, env = "ACTOR_MAX_CONN_PARAMS_SIZE")]
    pub max_conn_params_size: Option<usize>,

    /// Largest accepted incoming message, in bytes
    #[arg(long, env = "ACTOR_MAX_MESSAGE_SIZE")]
    pub max_message_size: Option<usize>,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,
}
