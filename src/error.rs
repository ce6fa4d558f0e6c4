//! Error taxonomy shared by the dispatcher, relay, and supervisor.
//!
//! [`ErrorKind`] names every failure the pipeline can report and maps it to
//! a JSON-RPC error code. [`CallError`] is the single error channel returned
//! by [`RpcBackend::send_request`](crate::system::RpcBackend::send_request):
//! timeouts, dead processes, and unparseable output all surface as `Err`.

use std::time::Duration;

use crate::protocol::{RequestId, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed JSON-RPC on the wire.
    InvalidRequest,
    /// No tool registered under the requested method name.
    MethodNotFound,
    /// A tool handler returned an error or panicked.
    HandlerFailure,
    /// The relay could not forward a request to the dispatcher.
    BridgeFailure,
    /// No response arrived within the wait bound.
    Timeout,
    /// A supervised process exited while a call was pending.
    ProcessDied,
    /// The supervisor has not been started.
    NotRunning,
    /// A correlated output line was not a valid JSON-RPC response.
    InvalidResponse,
}

impl ErrorKind {
    /// JSON-RPC error code for this kind.
    pub fn code(&self) -> i64 {
        match self {
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::HandlerFailure => -32000,
            ErrorKind::BridgeFailure => -32001,
            ErrorKind::Timeout => -32002,
            ErrorKind::ProcessDied => -32003,
            ErrorKind::NotRunning => -32004,
            ErrorKind::InvalidResponse => -32005,
        }
    }

    pub fn from_code(code: i64) -> Option<ErrorKind> {
        [
            ErrorKind::InvalidRequest,
            ErrorKind::MethodNotFound,
            ErrorKind::HandlerFailure,
            ErrorKind::BridgeFailure,
            ErrorKind::Timeout,
            ErrorKind::ProcessDied,
            ErrorKind::NotRunning,
            ErrorKind::InvalidResponse,
        ]
        .into_iter()
        .find(|k| k.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::MethodNotFound => "method_not_found",
            ErrorKind::HandlerFailure => "handler_failure",
            ErrorKind::BridgeFailure => "bridge_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProcessDied => "process_died",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::InvalidResponse => "invalid_response",
        }
    }

    /// Build the wire error object for this kind.
    pub fn rpc_error(&self, message: impl Into<String>) -> RpcError {
        RpcError {
            code: self.code(),
            message: message.into(),
        }
    }
}

/// Failure of a call made through the supervisor or the in-process host.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("system not running: call start() first")]
    NotRunning,

    #[error("{process} process died ({status})")]
    ProcessDied { process: String, status: String },

    #[error("timed out after {after:?} waiting for response to request {id}")]
    Timeout { id: RequestId, after: Duration },

    #[error("invalid response: {raw}")]
    InvalidResponse { raw: String },

    #[error("bridge failure: {0}")]
    BridgeFailure(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to launch {process}: {source}")]
    Spawn {
        process: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::NotRunning => ErrorKind::NotRunning,
            CallError::ProcessDied { .. } => ErrorKind::ProcessDied,
            CallError::Timeout { .. } => ErrorKind::Timeout,
            CallError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            CallError::BridgeFailure(_) => ErrorKind::BridgeFailure,
            CallError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            // Launch and setup failures leave the system not running.
            CallError::Spawn { .. } | CallError::Io { .. } => ErrorKind::NotRunning,
        }
    }

    pub fn process_died(process: &str, status: impl Into<String>) -> Self {
        CallError::ProcessDied {
            process: process.to_string(),
            status: status.into(),
        }
    }
}
