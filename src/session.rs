//! # MCP Session
//!
//! This module implements the correlation and dispatch layer at the core
//! of the MCP runtime. A [`Session`] owns one transport and multiplexes
//! outbound requests against inbound responses and notifications on that
//! single duplex stream:
//!
//! - Outbound requests are correlated by identifier against a pending
//!   map and complete with a typed result, a peer error, a timeout, or a
//!   cancellation, exactly one of them.
//! - Inbound requests are routed to registered handlers and answered
//!   with exactly one response each.
//! - Inbound notifications are routed to registered handlers; their
//!   outcomes are discarded.
//!
//! Handlers are registered on a [`SessionBuilder`] before the session is
//! connected and are immutable afterwards. State mutations (`pending`,
//! the lifecycle state, the id counter) are owned by the session; user
//! handlers run on spawned workers so they can block or perform I/O
//! without stalling the transport's reader.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};

use crate::errors::{Error, Result};
use crate::transport::{
    InboundHandler, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion, Message, RequestId, Transport, TransportEvent,
};
use crate::types::ErrorCode;

/// The default request timeout, in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MSEC: u64 = 60000;

/// How long `close_gracefully` waits for in-flight requests to settle
/// before cancelling the stragglers.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle states of a session.
///
/// Transitions: `Connected` on construction over a started transport,
/// `Initialized` after the `initialize` handshake completes (client
/// side: the `notifications/initialized` notification was sent; server
/// side: it was received), `Closing` while draining, `Closed` at the
/// end. A fatal transport error jumps straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet bound to a transport
    Unconnected,
    /// Bound to a started transport, handshake not yet complete
    Connected,
    /// Handshake complete, normal traffic allowed
    Initialized,
    /// Draining in-flight requests before closing
    Closing,
    /// Terminated; all traffic is rejected
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unconnected => "unconnected",
            SessionState::Connected => "connected",
            SessionState::Initialized => "initialized",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

type PendingSender = oneshot::Sender<Result<serde_json::Value>>;

/// The correlation and dispatch layer over a transport.
///
/// Cloning a `Session` is cheap and yields another handle to the same
/// underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingSender>>,
    request_handlers: HashMap<String, Box<dyn RequestHandler>>,
    notification_handlers: HashMap<String, Box<dyn NotificationHandler>>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Creates a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Returns the session's current lifecycle state.
    pub async fn state(&self) -> SessionState {
        *self.inner.state.lock().await
    }

    /// Starts the underlying transport, wiring its inbound events into
    /// this session. Called by [`SessionBuilder::connect`]; only needed
    /// directly when the session was built with [`SessionBuilder::build`].
    pub async fn start(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let handler: InboundHandler = Arc::new(move |event| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.on_inbound(event).await,
                    None => anyhow::bail!("session dropped"),
                }
            })
        });
        self.inner
            .transport
            .start(handler)
            .await
            .map_err(Error::Transport)
    }

    /// Sends a request and awaits its completion.
    ///
    /// Mints a fresh stringified id, installs a pending entry with a
    /// deadline of `request_timeout` from now, and submits the request.
    /// Completes with the peer's result, [`Error::Protocol`] if the peer
    /// returns an error, [`Error::Timeout`] at the deadline, or
    /// [`Error::Cancelled`] if the session closes first. A transport
    /// send failure removes the pending entry synchronously and is
    /// returned as [`Error::Transport`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.inner.check_outbound(method, true).await?;

        let id = RequestId::String(
            self.inner
                .next_id
                .fetch_add(1, Ordering::SeqCst)
                .to_string(),
        );
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id.clone(), tx);

        let request = Message::Request(JsonRpcRequest {
            id: id.clone(),
            method: method.to_owned(),
            params,
            jsonrpc: JsonRpcVersion::default(),
        });
        if let Err(e) = self.inner.transport.send(request).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(Error::Transport(e));
        }

        // Per-entry deadline. Firing removes the entry, so it is
        // idempotent with response arrival: first one wins, a late
        // response finds nothing and is dropped.
        let deadline_inner = self.inner.clone();
        let deadline_id = id.clone();
        let request_timeout = self.inner.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(request_timeout).await;
            if let Some(tx) = deadline_inner.pending.lock().await.remove(&deadline_id) {
                let _ = tx.send(Err(Error::Timeout));
            }
        });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Sends a request and decodes its result into `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<T> {
        let value = self.request(method, params).await?;
        Ok(crate::transport::unmarshal(value)?)
    }

    /// Sends a notification. Fire-and-forget: completes once the
    /// transport accepts the message; never creates a pending entry.
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        self.inner.check_outbound(method, false).await?;
        let notification = Message::Notification(JsonRpcNotification {
            method: method.to_owned(),
            params,
            jsonrpc: JsonRpcVersion::default(),
        });
        self.inner
            .transport
            .send(notification)
            .await
            .map_err(Error::Transport)?;
        if method == "notifications/initialized" {
            self.inner.advance_initialized().await;
        }
        Ok(())
    }

    /// Closes the session gracefully.
    ///
    /// New `request`/`notify` calls are refused immediately; in-flight
    /// requests get a drain window to settle, after which any survivors
    /// complete with [`Error::Cancelled`]. The transport is then closed
    /// and the session ends in `Closed`. Idempotent.
    pub async fn close_gracefully(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            match *state {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                _ => *state = SessionState::Closing,
            }
        }

        let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
        while tokio::time::Instant::now() < deadline {
            if self.inner.pending.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        self.inner.cancel_all(|| Error::Cancelled).await;

        let result = self.inner.transport.close_gracefully().await;
        *self.inner.state.lock().await = SessionState::Closed;
        result.map_err(Error::Transport)
    }

    /// Closes the session immediately.
    ///
    /// Every in-flight request completes with [`Error::Cancelled`]. The
    /// transport is asked to close but this call does not wait for it.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.inner.cancel_all(|| Error::Cancelled).await;

        let transport = self.inner.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.close_gracefully().await {
                tracing::debug!("transport close after session close failed: {:?}", e);
            }
        });
    }
}

impl SessionInner {
    /// Gate for outbound traffic against the lifecycle state. Before
    /// initialization only the handshake itself may pass: the
    /// `initialize` request and the `notifications/initialized`
    /// notification.
    async fn check_outbound(&self, method: &str, is_request: bool) -> Result<()> {
        let state = *self.state.lock().await;
        let allowed = match state {
            SessionState::Initialized => !(is_request && method == "initialize"),
            SessionState::Connected => {
                (is_request && method == "initialize")
                    || (!is_request && method == "notifications/initialized")
            }
            SessionState::Unconnected | SessionState::Closing | SessionState::Closed => false,
        };
        if allowed {
            Ok(())
        } else {
            let kind = if is_request { "request" } else { "notify" };
            Err(Error::State {
                op: format!("{} `{}`", kind, method),
                state,
            })
        }
    }

    async fn advance_initialized(&self) {
        let mut state = self.state.lock().await;
        if *state == SessionState::Connected {
            *state = SessionState::Initialized;
        }
    }

    /// Entry point for transport events. Routing happens here on the
    /// transport's delivery context; handler invocation is spawned onto
    /// separate workers so a slow handler never blocks the reader.
    async fn on_inbound(self: Arc<Self>, event: TransportEvent) -> anyhow::Result<()> {
        if *self.state.lock().await == SessionState::Closed {
            anyhow::bail!("session is closed");
        }
        match event {
            TransportEvent::Closed(error) => {
                self.fail(error).await;
                Ok(())
            }
            TransportEvent::Message(Message::Response(response)) => {
                self.complete(response).await;
                Ok(())
            }
            TransportEvent::Message(Message::Request(request)) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    let response = inner.dispatch_request(request).await;
                    if let Err(e) = inner.transport.send(Message::Response(response)).await {
                        tracing::warn!("failed to send response: {:?}", e);
                    }
                });
                Ok(())
            }
            TransportEvent::Message(Message::Notification(notification)) => {
                if notification.method == "notifications/initialized" {
                    self.advance_initialized().await;
                }
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.dispatch_notification(notification).await;
                });
                Ok(())
            }
        }
    }

    /// Delivers an inbound response to the matching pending request.
    /// A response whose id has no pending entry is dropped.
    async fn complete(&self, response: JsonRpcResponse) {
        let sender = self.pending.lock().await.remove(&response.id);
        match sender {
            Some(tx) => {
                let outcome = match response.error {
                    Some(error) => Err(Error::from(error)),
                    None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            None => {
                tracing::warn!(id = %response.id, "dropping response with no pending request");
            }
        }
    }

    /// Routes an inbound request to its handler and builds the single
    /// response the peer is owed.
    async fn dispatch_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match self.request_handlers.get(&request.method) {
            Some(handler) => match handler.handle(request).await {
                Ok(result) => JsonRpcResponse {
                    id,
                    result: Some(result),
                    error: None,
                    jsonrpc: JsonRpcVersion::default(),
                },
                Err(e) => {
                    let code = e
                        .downcast_ref::<Error>()
                        .map(Error::jsonrpc_code)
                        .unwrap_or(ErrorCode::InternalError as i32);
                    JsonRpcResponse {
                        id,
                        result: None,
                        error: Some(JsonRpcError {
                            code,
                            message: e.to_string(),
                            data: None,
                        }),
                        jsonrpc: JsonRpcVersion::default(),
                    }
                }
            },
            None => {
                let err = Error::MethodNotFound(request.method);
                JsonRpcResponse {
                    id,
                    result: None,
                    error: Some(JsonRpcError {
                        code: err.jsonrpc_code(),
                        message: err.to_string(),
                        data: None,
                    }),
                    jsonrpc: JsonRpcVersion::default(),
                }
            }
        }
    }

    /// Routes an inbound notification to its handler. Handler errors are
    /// logged and swallowed; notifications never produce responses.
    async fn dispatch_notification(&self, notification: JsonRpcNotification) {
        let method = notification.method.clone();
        match self.notification_handlers.get(&method) {
            Some(handler) => {
                if let Err(e) = handler.handle(notification).await {
                    tracing::error!("error handling notification {}: {}", method, e);
                }
            }
            None => {
                tracing::debug!("no handler for notification: {}", method);
            }
        }
    }

    /// Fatal-transport path: the session jumps to `Closed` and every
    /// in-flight request completes with the transport error.
    async fn fail(&self, error: Option<anyhow::Error>) {
        let was_closing = {
            let mut state = self.state.lock().await;
            let was_closing = matches!(*state, SessionState::Closing | SessionState::Closed);
            *state = SessionState::Closed;
            was_closing
        };
        let message = match &error {
            Some(e) => e.to_string(),
            None => "connection closed".to_owned(),
        };
        if was_closing {
            tracing::debug!("transport ended during shutdown: {}", message);
            self.cancel_all(|| Error::Cancelled).await;
        } else {
            tracing::warn!("transport ended: {}", message);
            self.cancel_all(|| Error::Transport(anyhow::anyhow!(message.clone())))
                .await;
        }
    }

    async fn cancel_all(&self, make_error: impl Fn() -> Error) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(make_error()));
        }
    }
}

/// Builder for creating configured sessions.
///
/// Request and notification handlers are installed here, before the
/// session exists; once [`connect`](SessionBuilder::connect) runs, the
/// handler maps are frozen.
pub struct SessionBuilder {
    request_timeout: Duration,
    request_handlers: HashMap<String, Box<dyn RequestHandler>>,
    notification_handlers: HashMap<String, Box<dyn NotificationHandler>>,
}

impl SessionBuilder {
    /// Creates a new session builder with the default request timeout.
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MSEC),
            request_handlers: HashMap::new(),
            notification_handlers: HashMap::new(),
        }
    }

    /// Sets the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Registers a typed request handler for `method`.
    ///
    /// The handler receives the decoded params (an empty object when the
    /// request carries none) and its result is serialized into the
    /// response. A params decode failure is reported to the peer as
    /// `-32602`; any other handler error as `-32603`.
    pub fn request_handler<Req, Resp>(
        mut self,
        method: &str,
        handler: impl Fn(Req) -> Pin<Box<dyn Future<Output = anyhow::Result<Resp>> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
    {
        let handler = TypedRequestHandler {
            handler: Box::new(handler),
            _phantom: std::marker::PhantomData,
        };
        self.request_handlers
            .insert(method.to_string(), Box::new(handler));
        self
    }

    /// Checks if a request handler exists for a method.
    pub fn has_request_handler(&self, method: &str) -> bool {
        self.request_handlers.contains_key(method)
    }

    /// Registers a typed notification handler for `method`.
    pub fn notification_handler<N>(
        mut self,
        method: &str,
        handler: impl Fn(N) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self
    where
        N: DeserializeOwned + Send + Sync + 'static,
    {
        let handler = TypedNotificationHandler {
            handler: Box::new(handler),
            _phantom: std::marker::PhantomData,
        };
        self.notification_handlers
            .insert(method.to_string(), Box::new(handler));
        self
    }

    /// Checks if a notification handler exists for a method.
    pub fn has_notification_handler(&self, method: &str) -> bool {
        self.notification_handlers.contains_key(method)
    }

    /// Builds the session over `transport` without starting it.
    ///
    /// The session is in `Connected` but will not see inbound traffic
    /// until [`Session::start`] runs. Most callers want
    /// [`connect`](SessionBuilder::connect) instead.
    pub fn build(self, transport: Arc<dyn Transport>) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                transport,
                request_timeout: self.request_timeout,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                request_handlers: self.request_handlers,
                notification_handlers: self.notification_handlers,
                state: Mutex::new(SessionState::Connected),
            }),
        }
    }

    /// Builds the session and immediately starts the transport.
    pub async fn connect(self, transport: Arc<dyn Transport>) -> Result<Session> {
        let session = self.build(transport);
        session.start().await?;
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for handling inbound JSON-RPC requests.
#[async_trait]
trait RequestHandler: Send + Sync {
    /// Handles an inbound request, producing the result value for the
    /// response.
    async fn handle(&self, request: JsonRpcRequest) -> anyhow::Result<serde_json::Value>;
}

/// Trait for handling inbound JSON-RPC notifications.
#[async_trait]
trait NotificationHandler: Send + Sync {
    /// Handles an inbound notification.
    async fn handle(&self, notification: JsonRpcNotification) -> anyhow::Result<()>;
}

/// Adapts a typed handler function to the `RequestHandler` trait,
/// handling the deserialization of the params and serialization of the
/// result.
struct TypedRequestHandler<Req, Resp>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
{
    handler: Box<
        dyn Fn(Req) -> Pin<Box<dyn Future<Output = anyhow::Result<Resp>> + Send>> + Send + Sync,
    >,
    _phantom: std::marker::PhantomData<(Req, Resp)>,
}

#[async_trait]
impl<Req, Resp> RequestHandler for TypedRequestHandler<Req, Resp>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
{
    async fn handle(&self, request: JsonRpcRequest) -> anyhow::Result<serde_json::Value> {
        let params = match request.params {
            Some(value) if !value.is_null() => value,
            _ => json!({}),
        };
        let params: Req =
            serde_json::from_value(params).map_err(|e| anyhow::Error::new(Error::Serialization(e)))?;
        let result = (self.handler)(params).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Adapts a typed handler function to the `NotificationHandler` trait,
/// handling the deserialization of the params.
struct TypedNotificationHandler<N>
where
    N: DeserializeOwned + Send + Sync + 'static,
{
    handler: Box<dyn Fn(N) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>,
    _phantom: std::marker::PhantomData<N>,
}

#[async_trait]
impl<N> NotificationHandler for TypedNotificationHandler<N>
where
    N: DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, notification: JsonRpcNotification) -> anyhow::Result<()> {
        let params: N = match notification.params {
            Some(value) if !value.is_null() => serde_json::from_value(value)?,
            _ => serde_json::from_value(serde_json::Value::Null)?,
        };
        (self.handler)(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct MockTransport {
        handler: Mutex<Option<InboundHandler>>,
        sent: Mutex<Vec<Message>>,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handler: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
            })
        }

        async fn inject(&self, event: TransportEvent) -> anyhow::Result<()> {
            let handler = self.handler.lock().await.clone().expect("not started");
            handler(event).await
        }

        async fn sent(&self) -> Vec<Message> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn start(&self, handler: InboundHandler) -> anyhow::Result<()> {
            *self.handler.lock().await = Some(handler);
            Ok(())
        }

        async fn send(&self, message: Message) -> anyhow::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                anyhow::bail!("pipe broken");
            }
            self.sent.lock().await.push(message);
            Ok(())
        }

        async fn close_gracefully(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn initialized_session(builder: SessionBuilder) -> (Session, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let session = builder
            .connect(transport.clone() as Arc<dyn Transport>)
            .await
            .unwrap();
        // Peer-side initialized notification drives Connected -> Initialized.
        transport
            .inject(TransportEvent::Message(Message::Notification(
                JsonRpcNotification {
                    method: "notifications/initialized".to_owned(),
                    params: None,
                    jsonrpc: JsonRpcVersion::default(),
                },
            )))
            .await
            .unwrap();
        (session, transport)
    }

    fn response(id: RequestId, result: serde_json::Value) -> TransportEvent {
        TransportEvent::Message(Message::Response(JsonRpcResponse {
            id,
            result: Some(result),
            error: None,
            jsonrpc: JsonRpcVersion::default(),
        }))
    }

    fn sent_request_id(message: &Message) -> RequestId {
        match message {
            Message::Request(req) => req.id.clone(),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_completes_with_matching_response() {
        let (session, transport) = initialized_session(Session::builder()).await;

        let requester = session.clone();
        let handle = tokio::spawn(async move { requester.request("ping", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = transport.sent().await;
        let id = sent_request_id(&sent[0]);
        transport
            .inject(response(id, json!({"ok": true})))
            .await
            .unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert!(session.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn request_ids_are_unique_and_stringified() {
        let (session, transport) = initialized_session(Session::builder()).await;

        for _ in 0..3 {
            let requester = session.clone();
            tokio::spawn(async move { requester.request("ping", None).await });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ids: Vec<RequestId> = transport.sent().await.iter().map(sent_request_id).collect();
        assert_eq!(ids.len(), 3);
        for id in &ids {
            assert!(matches!(id, RequestId::String(_)));
        }
        let unique: std::collections::HashSet<_> = ids.into_iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_late_response_is_dropped() {
        let builder = Session::builder().request_timeout(Duration::from_millis(100));
        let (session, transport) = initialized_session(builder).await;

        let requester = session.clone();
        let handle = tokio::spawn(async move { requester.request("ping", None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = sent_request_id(&transport.sent().await[0]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(session.inner.pending.lock().await.is_empty());

        // A late response finds no entry and must not disturb anything.
        transport.inject(response(id, json!(null))).await.unwrap();
        assert!(session.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn peer_error_response_becomes_protocol_error() {
        let (session, transport) = initialized_session(Session::builder()).await;

        let requester = session.clone();
        let handle = tokio::spawn(async move { requester.request("tools/call", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let id = sent_request_id(&transport.sent().await[0]);
        transport
            .inject(TransportEvent::Message(Message::Response(JsonRpcResponse {
                id,
                result: None,
                error: Some(JsonRpcError {
                    code: -32602,
                    message: "bad arguments".to_owned(),
                    data: None,
                }),
                jsonrpc: JsonRpcVersion::default(),
            })))
            .await
            .unwrap();

        match handle.await.unwrap() {
            Err(Error::Protocol { code, message, .. }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad arguments");
            }
            other => panic!("expected protocol error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn send_failure_removes_pending_entry() {
        let (session, transport) = initialized_session(Session::builder()).await;
        transport.fail_sends.store(true, Ordering::SeqCst);

        let result = session.request("ping", None).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(session.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_request_method_gets_method_not_found_reply() {
        let (_session, transport) = initialized_session(Session::builder()).await;

        transport
            .inject(TransportEvent::Message(Message::Request(JsonRpcRequest {
                id: RequestId::from("7"),
                method: "no/such/method".to_owned(),
                params: None,
                jsonrpc: JsonRpcVersion::default(),
            })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::Response(resp) => {
                assert_eq!(resp.id, RequestId::from("7"));
                let error = resp.error.as_ref().unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Method not found: no/such/method");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn notifications_produce_no_outbound_message() {
        let builder = Session::builder().notification_handler(
            "notifications/tools/list_changed",
            |_: serde_json::Value| Box::pin(async { Ok(()) }),
        );
        let (_session, transport) = initialized_session(builder).await;

        transport
            .inject(TransportEvent::Message(Message::Notification(
                JsonRpcNotification {
                    method: "notifications/tools/list_changed".to_owned(),
                    params: None,
                    jsonrpc: JsonRpcVersion::default(),
                },
            )))
            .await
            .unwrap();
        // Unknown notifications are dropped the same way.
        transport
            .inject(TransportEvent::Message(Message::Notification(
                JsonRpcNotification {
                    method: "notifications/unknown".to_owned(),
                    params: None,
                    jsonrpc: JsonRpcVersion::default(),
                },
            )))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn request_handler_errors_become_error_responses() {
        let builder = Session::builder().request_handler(
            "tools/call",
            |_: serde_json::Value| -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>> {
                Box::pin(async { Err(anyhow::anyhow!("handler exploded")) })
            },
        );
        let (_session, transport) = initialized_session(builder).await;

        transport
            .inject(TransportEvent::Message(Message::Request(JsonRpcRequest {
                id: RequestId::from("3"),
                method: "tools/call".to_owned(),
                params: None,
                jsonrpc: JsonRpcVersion::default(),
            })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = transport.sent().await;
        match &sent[0] {
            Message::Response(resp) => {
                let error = resp.error.as_ref().unwrap();
                assert_eq!(error.code, -32603);
                assert_eq!(error.message, "handler exploded");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_cancels_in_flight_requests() {
        let (session, _transport) = initialized_session(Session::builder()).await;

        let requester = session.clone();
        let handle = tokio::spawn(async move { requester.request("ping", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close().await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(session.state().await, SessionState::Closed);

        // Rejected outright once closed.
        let result = session.request("ping", None).await;
        assert!(matches!(result, Err(Error::State { .. })));
    }

    #[tokio::test]
    async fn close_gracefully_waits_for_pending_then_empties() {
        let (session, transport) = initialized_session(Session::builder()).await;

        let requester = session.clone();
        let handle = tokio::spawn(async move { requester.request("ping", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = sent_request_id(&transport.sent().await[0]);

        let closer = session.clone();
        let close_handle = tokio::spawn(async move { closer.close_gracefully().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Drain completes once the response lands.
        transport.inject(response(id, json!(null))).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
        close_handle.await.unwrap().unwrap();
        assert!(session.inner.pending.lock().await.is_empty());
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn transport_failure_is_fatal_and_completes_pending() {
        let (session, transport) = initialized_session(Session::builder()).await;

        let requester = session.clone();
        let handle = tokio::spawn(async move { requester.request("ping", None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport
            .inject(TransportEvent::Closed(Some(anyhow::anyhow!("pipe broken"))))
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn requests_are_rejected_before_initialization() {
        let transport = MockTransport::new();
        let session = Session::builder()
            .connect(transport.clone() as Arc<dyn Transport>)
            .await
            .unwrap();

        assert_eq!(session.state().await, SessionState::Connected);
        let result = session.request("tools/list", None).await;
        assert!(matches!(result, Err(Error::State { .. })));

        // The handshake traffic itself is allowed.
        session
            .notify("notifications/initialized", None)
            .await
            .unwrap();
        assert_eq!(session.state().await, SessionState::Initialized);
    }
}
