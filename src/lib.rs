//! # MCP Session Runtime
//!
//! `mcp-session` is a Rust implementation of the core of a Model Context
//! Protocol (MCP) client/server runtime: a bidirectional JSON-RPC 2.0
//! session layered over a pluggable message transport, together with the
//! protocol lifecycle (initialization, capability negotiation, graceful
//! shutdown) and the feature dispatchers for tools, resources, prompts,
//! roots, and sampling.
//!
//! ## Architecture
//!
//! The library is organized into several main components:
//!
//! - **Session**: the correlation and dispatch core. It multiplexes
//!   outbound requests against inbound responses and notifications on a
//!   single duplex stream, correlates them by identifier, handles
//!   timeouts and cancellation, routes inbound traffic to registered
//!   handlers, and orchestrates graceful shutdown
//! - **Transport**: an opaque ordered pipe of protocol messages, with
//!   stdio (newline-delimited JSON over a child process's standard
//!   streams) and SSE (HTTP event stream plus a POST message endpoint)
//!   implementations
//! - **Client / Server**: thin typed facades that call
//!   `session.request` / `session.notify` and register the feature
//!   handlers each side serves
//! - **Types**: the wire envelope and MCP feature payloads
//! - **Errors**: the typed error taxonomy every operation completes with
//!
//! ## Lifecycle
//!
//! A session is created bound to a started transport, becomes
//! initialized after the `initialize` handshake (client side: the
//! `notifications/initialized` notification was sent; server side: it
//! was received), and terminates through `close_gracefully` (drain, then
//! transport close) or `close` (immediate).

pub mod client;
pub mod errors;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;
pub mod types;

pub use client::{Client, ClientBuilder};
pub use errors::{Error, Result};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionBuilder, SessionState};
