use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;
use crate::metadata::ActorMetadata;

/// Deadline for the before-connect hook.
pub const BEFORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the on-connect hook.
pub const ON_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for persistent connections to close.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_millis(1500);

/// Tunables an actor author can set on the builder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActorConfig {
    pub state: StateConfig,
    pub rpc: RpcConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConfig {
    pub save_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub max_connection_parameters_size: usize,
    pub max_incoming_message_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_connection_parameters_size: 8 * 1024,
            max_incoming_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PORT_HTTP is not set")]
    MissingPort,

    #[error("PORT_HTTP must be a port number, got `{0}`")]
    InvalidPort(String),
}

/// Process configuration derived from CLI/env.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub metadata: ActorMetadata,
    pub kv_path: Option<PathBuf>,
    save_interval: Option<Duration>,
    rpc_timeout: Option<Duration>,
    max_connection_parameters_size: Option<usize>,
    max_incoming_message_size: Option<usize>,
}

impl RuntimeConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let raw_port = cli.port.as_deref().map(str::trim).unwrap_or_default();
        if raw_port.is_empty() {
            return Err(ConfigError::MissingPort);
        }
        let port = raw_port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(raw_port.to_string()))?;

        let metadata = match &cli.actor_id {
            Some(id) => ActorMetadata::new(id.clone(), cli.debug_url.clone()),
            None => ActorMetadata {
                debug_url_base: cli.debug_url.clone(),
                ..ActorMetadata::default()
            },
        };

        Ok(Self {
            host: cli.host.clone(),
            port,
            metadata,
            kv_path: cli.kv_path.clone(),
            save_interval: cli.save_interval_ms.map(Duration::from_millis),
            rpc_timeout: cli.rpc_timeout_ms.map(Duration::from_millis),
            max_connection_parameters_size: cli.max_conn_params_size,
            max_incoming_message_size: cli.max_message_size,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Layer the values set through CLI/env over the actor's own config.
    pub fn apply(&self, mut config: ActorConfig) -> ActorConfig {
        if let Some(interval) = self.save_interval {
            config.state.save_interval = interval;
        }
        if let Some(timeout) = self.rpc_timeout {
            config.rpc.timeout = timeout;
        }
        if let Some(size) = self.max_connection_parameters_size {
            config.protocol.max_connection_parameters_size = size;
        }
        if let Some(size) = self.max_incoming_message_size {
            config.protocol.max_incoming_message_size = size;
        }
        config
    }
}
