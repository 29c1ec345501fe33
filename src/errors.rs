//! # Session Error Taxonomy
//!
//! Every failure a caller can observe from this crate is a variant of
//! [`Error`]. Outbound operations (`request`, `notify`, the facade
//! one-liners) surface errors as their completion value; inbound message
//! handling never raises; handler failures become error responses or
//! logged drops.

use crate::session::SessionState;
use crate::types::ErrorCode;

/// Result alias used throughout the session and facade layers.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the MCP session runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure on the underlying pipe. Fatal to the session: every
    /// in-flight request completes with this error and the session
    /// transitions to `Closed`.
    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// A well-formed error response from the peer.
    #[error("peer returned error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code reported by the peer
        code: i32,
        /// Human-readable message reported by the peer
        message: String,
        /// Optional peer-supplied detail
        data: Option<serde_json::Value>,
    },

    /// The per-request deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The session was closed (or the caller cancelled) while the
    /// request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// `initialize` returned a protocol version this client does not speak.
    #[error("unsupported protocol version: expected {expected}, peer offered {actual}")]
    VersionMismatch {
        /// The version this side requested
        expected: String,
        /// The version the peer replied with
        actual: String,
    },

    /// No handler is registered for an inbound request method.
    /// Surfaced to the peer as a JSON-RPC `-32601` response.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid construction-time configuration, e.g. declaring the
    /// sampling capability without providing a handler.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The operation is illegal in the session's current state.
    #[error("cannot {op} while session is {state}")]
    State {
        /// The rejected operation
        op: String,
        /// The state the session was in
        state: SessionState,
    },

    /// A root with this URI is already registered.
    #[error("root already exists: {0}")]
    AlreadyExists(String),

    /// No root with this URI is registered.
    #[error("root not found: {0}")]
    NotFound(String),

    /// The operation requires a capability the peer (or this side) never
    /// declared during the handshake.
    #[error("capability not declared: {0}")]
    CapabilityMissing(&'static str),

    /// A payload could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// The JSON-RPC error code used when this error is reported back to
    /// the peer as a response to an inbound request.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Error::MethodNotFound(_) => ErrorCode::MethodNotFound as i32,
            Error::Serialization(_) => ErrorCode::InvalidParams as i32,
            Error::Protocol { code, .. } => *code,
            _ => ErrorCode::InternalError as i32,
        }
    }
}

impl From<crate::transport::JsonRpcError> for Error {
    fn from(err: crate::transport::JsonRpcError) -> Self {
        Error::Protocol {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
