//! Error taxonomy shared by the runtime and actor authors.
//!
//! Every [`ActorError`] carries a stable string code. Public errors are
//! returned to clients verbatim; everything else is masked behind
//! [`INTERNAL_ERROR_CODE`] and logged server-side.

use actor_protocol::CodecError;
use serde_json::{json, Value};

use crate::metadata::ActorMetadata;

pub const INTERNAL_ERROR_CODE: &str = "internal_error";
pub const INTERNAL_ERROR_DESCRIPTION: &str =
    "Internal error. Read the actor logs for more details.";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ActorError {
    #[error("State not enabled. Declare an `on_initialize` hook to use state.")]
    StateNotEnabled,

    #[error("Connection state not enabled. Declare an `on_before_connect` hook to use connection state.")]
    ConnectionStateNotEnabled,

    #[error("RPC timed out")]
    RpcTimedOut,

    #[error("RPC not found")]
    RpcNotFound,

    #[error("Invalid protocol format `{}`", .0.as_deref().unwrap_or("<missing>"))]
    InvalidProtocolFormat(Option<String>),

    #[error("Connection parameters too long")]
    ConnectionParametersTooLong,

    #[error("Malformed connection parameters: {0}")]
    MalformedConnectionParameters(String),

    #[error("Message too long")]
    MessageTooLong,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid state type at `{path}`. Only JSON-serializable values can be stored in state.")]
    InvalidStateType { path: String },

    #[error("State too large to inspect")]
    StateTooLarge,

    #[error("Internal error: {0}")]
    Internal(String),

    /// Raised by actor code; always public.
    #[error("{message}")]
    User {
        code: String,
        message: String,
        metadata: Option<Value>,
    },
}

impl ActorError {
    /// Application error with a caller-chosen code.
    pub fn user(code: impl Into<String>, message: impl Into<String>) -> Self {
        ActorError::User {
            code: code.into(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn user_with_metadata(
        code: impl Into<String>,
        message: impl Into<String>,
        metadata: Value,
    ) -> Self {
        ActorError::User {
            code: code.into(),
            message: message.into(),
            metadata: Some(metadata),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ActorError::Internal(message.into())
    }

    pub fn code(&self) -> &str {
        match self {
            ActorError::StateNotEnabled => "state_not_enabled",
            ActorError::ConnectionStateNotEnabled => "connection_state_not_enabled",
            ActorError::RpcTimedOut => "rpc_timed_out",
            ActorError::RpcNotFound => "rpc_not_found",
            ActorError::InvalidProtocolFormat(_) => "invalid_protocol_format",
            ActorError::ConnectionParametersTooLong => "connection_parameters_too_long",
            ActorError::MalformedConnectionParameters(_) => "malformed_connection_parameters",
            ActorError::MessageTooLong => "message_too_long",
            ActorError::MalformedMessage(_) => "malformed_message",
            ActorError::InvalidStateType { .. } => "invalid_state_type",
            ActorError::StateTooLarge => "state_too_large",
            ActorError::Internal(_) => INTERNAL_ERROR_CODE,
            ActorError::User { code, .. } => code,
        }
    }

    pub fn is_public(&self) -> bool {
        !matches!(self, ActorError::StateTooLarge | ActorError::Internal(_))
    }

    pub fn metadata(&self) -> Option<Value> {
        match self {
            ActorError::InvalidStateType { path } => Some(json!({ "path": path })),
            ActorError::User { metadata, .. } => metadata.clone(),
            _ => None,
        }
    }
}

impl From<CodecError> for ActorError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MessageTooLong { .. } => ActorError::MessageTooLong,
            CodecError::Malformed(cause) => ActorError::MalformedMessage(cause),
            CodecError::Encode(cause) => ActorError::Internal(cause),
        }
    }
}

/// What a client is allowed to see about a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub metadata: Option<Value>,
    pub public: bool,
}

impl ErrorPayload {
    /// Classify an arbitrary error for the wire.
    ///
    /// Public [`ActorError`]s pass through; anything else collapses to the
    /// generic internal error with a pointer to this actor instance.
    pub fn from_error(err: &anyhow::Error, metadata: &ActorMetadata) -> Self {
        match err.downcast_ref::<ActorError>() {
            Some(actor_err) if actor_err.is_public() => Self {
                code: actor_err.code().to_string(),
                message: actor_err.to_string(),
                metadata: actor_err.metadata(),
                public: true,
            },
            _ => Self {
                code: INTERNAL_ERROR_CODE.to_string(),
                message: INTERNAL_ERROR_DESCRIPTION.to_string(),
                metadata: Some(metadata.debug_metadata()),
                public: false,
            },
        }
    }
}
