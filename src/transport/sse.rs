//! Server-Sent Events transport (server side).
//!
//! [`SseServerTransport`] runs an HTTP server with two endpoints: a
//! `GET /sse` that opens an event stream carrying server→client
//! messages, and a `POST /message` that accepts one client→server
//! message per request body. Each SSE connection is assigned a UUID
//! session id on connect; the POST endpoint must carry the same id to be
//! routed to the owning session.
//!
//! Every accepted connection surfaces as a [`SseSessionTransport`],
//! which implements [`Transport`] and is consumed through
//! [`SseServerTransport::accept`], typically by wiring it straight into
//! a new [`crate::session::Session`]. Outbound queues are bounded per
//! connection, so a slow SSE reader blocks only its own writers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use actix_web::{
    middleware::Logger,
    web::{self, Query},
    App, HttpResponse, HttpServer,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::transport::{
    InboundHandler, JsonRpcNotification, JsonRpcVersion, Message, Transport, TransportEvent,
};

/// Outbound queue capacity per SSE connection.
const OUTBOUND_QUEUE_SIZE: usize = 100;

/// Interval between keep-alive pings on an idle SSE connection.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Per-connection state shared between the HTTP handlers and the
/// session-facing transport handle.
struct SseConnection {
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    handler: Arc<Mutex<Option<InboundHandler>>>,
}

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<SseConnection>>>>;

/// Server transport acceptor for MCP clients connecting over SSE.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use mcp_session::session::Session;
/// use mcp_session::transport::SseServerTransport;
///
/// async fn example() -> anyhow::Result<()> {
///     let server = SseServerTransport::new("127.0.0.1", 3000);
///     let acceptor = server.clone();
///     tokio::spawn(async move { acceptor.serve().await });
///     while let Some(peer) = server.accept().await {
///         let session = Session::builder().connect(Arc::new(peer)).await?;
///         let _ = session;
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SseServerTransport {
    host: String,
    port: u16,
    connections: ConnectionMap,
    accept_tx: mpsc::Sender<SseSessionTransport>,
    accept_rx: Arc<Mutex<mpsc::Receiver<SseSessionTransport>>>,
}

impl SseServerTransport {
    /// Creates a new acceptor bound to `host:port` once served.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        Self {
            host: host.into(),
            port,
            connections: Arc::new(Mutex::new(HashMap::new())),
            accept_tx,
            accept_rx: Arc::new(Mutex::new(accept_rx)),
        }
    }

    /// Runs the HTTP server. Resolves only on bind failure or shutdown.
    pub async fn serve(&self) -> Result<()> {
        let transport = self.clone();
        let server = HttpServer::new(move || {
            App::new()
                .wrap(Logger::default())
                .app_data(web::Data::new(transport.clone()))
                .route("/sse", web::get().to(sse_handler))
                .route("/message", web::post().to(message_handler))
        })
        .bind((self.host.clone(), self.port))?
        .run();

        server
            .await
            .map_err(|e| anyhow::anyhow!("server error: {:?}", e))
    }

    /// Waits for the next connected peer.
    ///
    /// Returns `None` once the acceptor is shut down.
    pub async fn accept(&self) -> Option<SseSessionTransport> {
        self.accept_rx.lock().await.recv().await
    }

    async fn register(&self) -> (String, SseSessionTransport) {
        let session_id = Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
        let connection = Arc::new(SseConnection {
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            handler: Arc::new(Mutex::new(None)),
        });
        self.connections
            .lock()
            .await
            .insert(session_id.clone(), connection.clone());

        let transport = SseSessionTransport {
            session_id: session_id.clone(),
            connection,
            connections: self.connections.clone(),
        };
        (session_id, transport)
    }

    async fn connection(&self, session_id: &str) -> Option<Arc<SseConnection>> {
        self.connections.lock().await.get(session_id).cloned()
    }
}

/// One connected SSE peer, usable as the transport under a session.
#[derive(Clone)]
pub struct SseSessionTransport {
    session_id: String,
    connection: Arc<SseConnection>,
    connections: ConnectionMap,
}

impl SseSessionTransport {
    /// The session id assigned to this peer on SSE connect.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl Transport for SseSessionTransport {
    async fn start(&self, handler: InboundHandler) -> Result<()> {
        *self.connection.handler.lock().await = Some(handler);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.connection
            .outbound_tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("SSE connection closed"))
    }

    async fn close_gracefully(&self) -> Result<()> {
        // Removing the connection drops the outbound queue once the SSE
        // stream finishes draining it, which ends the event stream.
        self.connections.lock().await.remove(&self.session_id);
        *self.connection.handler.lock().await = None;
        Ok(())
    }
}

/// Handles SSE connection requests.
///
/// Registers a session, announces it on the acceptor channel, sends the
/// endpoint-info event, then streams outbound messages. A keep-alive
/// ping is queued while the connection stays registered.
async fn sse_handler(
    req: actix_web::HttpRequest,
    transport: web::Data<SseServerTransport>,
) -> HttpResponse {
    let client_ip = req
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!("new SSE connection from {}", client_ip);

    let (session_id, session_transport) = transport.register().await;
    let outbound_rx = session_transport.connection.outbound_rx.clone();

    if transport.accept_tx.send(session_transport).await.is_err() {
        tracing::warn!("acceptor dropped, refusing SSE connection");
        transport.connections.lock().await.remove(&session_id);
        return HttpResponse::ServiceUnavailable().finish();
    }

    tracing::info!(
        "SSE connection established for {} with session_id {}",
        client_ip,
        session_id
    );

    let endpoint_info = format!(
        "event: endpoint\ndata: /message?sessionId={}\n\n",
        session_id
    );

    // Keep-alive pings, stopped once the session is deregistered.
    let ping_transport = transport.clone();
    let ping_session_id = session_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;
            match ping_transport.connection(&ping_session_id).await {
                Some(connection) => {
                    let ping = Message::Notification(JsonRpcNotification {
                        method: "ping".to_owned(),
                        params: None,
                        jsonrpc: JsonRpcVersion::default(),
                    });
                    if connection.outbound_tx.send(ping).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });

    let stream = futures::stream::once(async move {
        Ok::<_, std::convert::Infallible>(web::Bytes::from(endpoint_info))
    })
    .chain(futures::stream::unfold(outbound_rx, move |outbound_rx| {
        async move {
            let message = outbound_rx.lock().await.recv().await;
            match message {
                Some(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("dropping unserializable SSE message: {}", e);
                            return Some((
                                Ok::<_, std::convert::Infallible>(web::Bytes::new()),
                                outbound_rx,
                            ));
                        }
                    };
                    let sse_data = format!("event: message\ndata: {}\n\n", json);
                    Some((
                        Ok::<_, std::convert::Infallible>(web::Bytes::from(sse_data)),
                        outbound_rx,
                    ))
                }
                None => None,
            }
        }
    }));

    HttpResponse::Ok()
        .append_header(("X-Session-Id", session_id))
        .content_type("text/event-stream")
        .streaming(stream)
}

/// Query parameters for message handling.
#[derive(Deserialize)]
struct MessageQuery {
    /// The session ID that identifies the client
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Handles incoming messages from clients.
///
/// Routes the message to the inbound handler of the owning session and
/// acknowledges with `202 Accepted`; the actual response travels back
/// over the SSE stream.
async fn message_handler(
    query: Query<MessageQuery>,
    message: web::Json<Message>,
    transport: web::Data<SseServerTransport>,
) -> HttpResponse {
    let Some(session_id) = &query.session_id else {
        return HttpResponse::BadRequest().body("Session ID not specified");
    };
    let Some(connection) = transport.connection(session_id).await else {
        return HttpResponse::NotFound().body(format!("Session {} not found", session_id));
    };
    let handler = connection.handler.lock().await.clone();
    let Some(handler) = handler else {
        return HttpResponse::ServiceUnavailable().body("Session not ready");
    };

    tracing::debug!("received message for session {}", session_id);
    match handler(TransportEvent::Message(message.into_inner())).await {
        Ok(()) => HttpResponse::Accepted().finish(),
        Err(e) => {
            tracing::warn!("session {} rejected message: {}", session_id, e);
            HttpResponse::Gone().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{JsonRpcRequest, RequestId};

    #[tokio::test]
    async fn accepted_connection_routes_messages_to_handler() {
        let server = SseServerTransport::new("127.0.0.1", 0);
        let (session_id, session_transport) = server.register().await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handler: InboundHandler = Arc::new(move |event| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                seen_tx.send(format!("{:?}", event)).unwrap();
                Ok(())
            })
        });
        session_transport.start(handler).await.unwrap();

        let connection = server.connection(&session_id).await.unwrap();
        let handler = connection.handler.lock().await.clone().unwrap();
        handler(TransportEvent::Message(Message::Request(JsonRpcRequest {
            id: RequestId::from("1"),
            method: "ping".to_owned(),
            params: None,
            jsonrpc: JsonRpcVersion::default(),
        })))
        .await
        .unwrap();

        let seen = seen_rx.recv().await.unwrap();
        assert!(seen.contains("ping"));
    }

    #[tokio::test]
    async fn close_deregisters_the_session() {
        let server = SseServerTransport::new("127.0.0.1", 0);
        let (session_id, session_transport) = server.register().await;
        assert!(server.connection(&session_id).await.is_some());

        session_transport.close_gracefully().await.unwrap();
        assert!(server.connection(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn outbound_queue_is_per_connection() {
        let server = SseServerTransport::new("127.0.0.1", 0);
        let (_, first) = server.register().await;
        let (_, second) = server.register().await;

        // Fill the first connection's queue to its bound.
        for i in 0..OUTBOUND_QUEUE_SIZE {
            first
                .send(Message::Request(JsonRpcRequest {
                    id: RequestId::from(i as u64),
                    method: "ping".to_owned(),
                    params: None,
                    jsonrpc: JsonRpcVersion::default(),
                }))
                .await
                .unwrap();
        }

        // The second connection is unaffected by the first being full.
        second
            .send(Message::Request(JsonRpcRequest {
                id: RequestId::from("x"),
                method: "ping".to_owned(),
                params: None,
                jsonrpc: JsonRpcVersion::default(),
            }))
            .await
            .unwrap();
    }
}
