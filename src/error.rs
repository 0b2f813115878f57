//! Client error taxonomy
//!
//! One enum per failure class the caller has to tell apart: bad
//! configuration, a start that never reached `connected`, an operation
//! attempted in the wrong state, a remote error, a dead connection, and
//! cleanup failures collected by `stop()`.

use crate::client::ConnectionState;
use crate::config::ConfigError;
use crate::io::{ProcessError, StreamTransportError};
use crate::rpc::JsonRpcError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error(transparent)]
    Config(#[from] ConfigError),

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// The agent never reached `connected`. `stderr` is whatever the process
    /// wrote before it failed, possibly empty.
    #[error("Failed to start agent: {reason}\nstderr: {stderr}")]
    StartFailed { reason: String, stderr: String },

    #[error("SDK protocol version mismatch: expected {expected}, server reports {}", describe_version(.actual))]
    ProtocolMismatch { expected: u32, actual: Option<u32> },

    #[error("Client not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    // ========================================================================
    // Wire
    // ========================================================================
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Transport error: {0}")]
    Transport(#[from] StreamTransportError),

    // ========================================================================
    // Sessions
    // ========================================================================
    #[error("Failed to destroy session {session_id}: {source}")]
    SessionDestroy {
        session_id: String,
        #[source]
        source: JsonRpcError,
    },

    #[error("Failed to delete session {session_id}: {reason}")]
    SessionDelete { session_id: String, reason: String },

    #[error("Failed to set foreground session: {0}")]
    Foreground(String),

    /// A `session.error` event ended a `send_and_wait`
    #[error("Session error: {0}")]
    Session(String),

    #[error("Timed out after {0:?} waiting for the session to become idle")]
    Timeout(std::time::Duration),
}

impl ClientError {
    pub fn start_failed(reason: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::StartFailed {
            reason: reason.into(),
            stderr: stderr.into(),
        }
    }

    /// The remote error code, when this is a JSON-RPC error response
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            Self::Rpc(JsonRpcError::Server { code, .. }) => Some(*code),
            _ => None,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Rpc(error) => error.is_connection_closed(),
            Self::SessionDestroy { source, .. } => source.is_connection_closed(),
            _ => false,
        }
    }
}

fn describe_version(version: &Option<u32>) -> String {
    match version {
        Some(version) => version.to_string(),
        None => "no version".to_string(),
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
