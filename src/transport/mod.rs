//! # MCP Transport Layer
//!
//! This module defines the message pipe underneath an MCP session. A
//! transport is deliberately dumb: it ferries opaque JSON-RPC messages in
//! both directions and knows nothing about correlation, dispatch, or the
//! protocol lifecycle; all of that lives in [`crate::session::Session`].
//!
//! The transport layer:
//! - Defines the wire envelope (`JsonRpcMessage` and friends)
//! - Defines the `Transport` trait every pipe implements
//! - Provides the stdio and SSE transport implementations
//!
//! Ordering contract: messages passed to `send` are delivered in call
//! order; inbound messages are handed to the session in wire-arrival
//! order, and each delivery is awaited before the next one starts
//! (backpressure).

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

mod stdio;
pub use stdio::{StdioClientTransport, StdioServerTransport};

#[cfg(feature = "sse")]
mod sse;
#[cfg(feature = "sse")]
pub use sse::{SseServerTransport, SseSessionTransport};

/// A message in the MCP protocol.
///
/// Currently, only JSON-RPC messages are supported, as defined in the
/// [MCP specification](https://spec.modelcontextprotocol.io/specification/basic/messages/).
pub type Message = JsonRpcMessage;

/// An event produced by a transport for its owning session.
///
/// Transports emit `Message` for every decoded inbound message, then a
/// single terminal `Closed` when the pipe reaches EOF or fails. No
/// events follow `Closed`.
pub enum TransportEvent {
    /// A decoded inbound protocol message
    Message(Message),
    /// The pipe ended; `Some` carries the fatal error, `None` is clean EOF
    Closed(Option<anyhow::Error>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Message(m) => f.debug_tuple("Message").field(m).finish(),
            TransportEvent::Closed(e) => f.debug_tuple("Closed").field(e).finish(),
        }
    }
}

/// Inbound delivery callback handed to [`Transport::start`].
///
/// The transport must await the returned future before delivering the
/// next event; an `Err` return means the receiving session is gone and
/// the transport should stop producing.
pub type InboundHandler =
    Arc<dyn Fn(TransportEvent) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Core trait that defines operations for MCP transports.
///
/// This trait abstracts the pipe layer, allowing the session to work
/// with different communication mechanisms (stdio, SSE, in-memory test
/// doubles).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts the transport and begins producing inbound events.
    ///
    /// Each inbound message is handed to `handler`, which must complete
    /// before the transport considers the message acknowledged.
    async fn start(&self, handler: InboundHandler) -> Result<()>;

    /// Enqueues one outbound message.
    ///
    /// Messages are delivered in `send` call order. Fails only on
    /// permanent transport error.
    async fn send(&self, message: Message) -> Result<()>;

    /// Stops accepting new sends, flushes in-flight messages, then
    /// releases resources.
    async fn close_gracefully(&self) -> Result<()>;
}

/// Converts a decoded-but-untyped payload into a typed feature value.
///
/// This is the seam that keeps the session and facades independent of
/// how the transport decoded the bytes.
pub fn unmarshal<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

/// Type representing a JSON-RPC request ID.
///
/// Ids may be strings or integers on the wire; this crate mints
/// stringified integers but correlates whatever the peer echoes back,
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// A numeric id
    Number(u64),
    /// A string id
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// Represents a JSON-RPC protocol version.
///
/// Included in all JSON-RPC messages; always "2.0" for the current
/// version of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct JsonRpcVersion(String);

impl Default for JsonRpcVersion {
    fn default() -> Self {
        JsonRpcVersion("2.0".to_owned())
    }
}

impl JsonRpcVersion {
    /// Returns the version as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Represents a JSON-RPC message.
///
/// Classification follows the shape of the object: a `method` with an
/// `id` is a request, a `method` without an `id` is a notification, and
/// an `id` with a `result` or `error` is a response. Objects matching
/// none of these fail to decode and are dropped by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// A request that expects a response
    Request(JsonRpcRequest),
    /// A notification that does not expect a response
    Notification(JsonRpcNotification),
    /// A response to a request
    Response(JsonRpcResponse),
}

/// Represents a JSON-RPC request.
///
/// A request is a message that expects a response with the same ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcRequest {
    /// The request ID, used to match with the response
    pub id: RequestId,
    /// The method name to call
    pub method: String,
    /// Optional parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// The JSON-RPC version
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion,
}

/// Represents a JSON-RPC notification.
///
/// A notification is a message that does not expect a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcNotification {
    /// The method name for the notification
    pub method: String,
    /// Optional parameters for the notification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// The JSON-RPC version
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion,
}

/// Represents a JSON-RPC response.
///
/// A response is a message sent in reply to a request with the same ID.
/// Exactly one of `result` and `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcResponse {
    /// The request ID this response corresponds to
    pub id: RequestId,
    /// The result of the request, if successful
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// The error, if the request failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// The JSON-RPC version
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion,
}

/// Represents a JSON-RPC error.
///
/// An error is included in a response when the request fails.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Optional additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
