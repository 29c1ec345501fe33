//! Shared in-memory transport double for integration tests.
//!
//! Records every outbound message and lets tests inject inbound events
//! as if they arrived off the wire.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use mcp_session::transport::{
    InboundHandler, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion, Message, RequestId, Transport, TransportEvent,
};

pub struct MockTransport {
    handler: Mutex<Option<InboundHandler>>,
    sent: Mutex<Vec<Message>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Delivers an event to the session as if it arrived off the wire.
    pub async fn inject(&self, event: TransportEvent) {
        let handler = self
            .handler
            .lock()
            .await
            .clone()
            .expect("transport not started");
        handler(event).await.expect("session rejected event");
    }

    /// Snapshot of everything the session sent so far.
    pub async fn sent(&self) -> Vec<Message> {
        self.sent.lock().await.clone()
    }

    /// Waits until at least `count` messages were sent, then returns them.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<Message> {
        for _ in 0..400 {
            {
                let sent = self.sent.lock().await;
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} sent messages", count);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, handler: InboundHandler) -> anyhow::Result<()> {
        *self.handler.lock().await = Some(handler);
        Ok(())
    }

    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.sent.lock().await.push(message);
        Ok(())
    }

    async fn close_gracefully(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn inbound_request(id: &str, method: &str, params: Option<serde_json::Value>) -> TransportEvent {
    TransportEvent::Message(Message::Request(JsonRpcRequest {
        id: RequestId::from(id),
        method: method.to_owned(),
        params,
        jsonrpc: JsonRpcVersion::default(),
    }))
}

pub fn inbound_notification(method: &str) -> TransportEvent {
    TransportEvent::Message(Message::Notification(JsonRpcNotification {
        method: method.to_owned(),
        params: None,
        jsonrpc: JsonRpcVersion::default(),
    }))
}

pub fn inbound_response(id: RequestId, result: serde_json::Value) -> TransportEvent {
    TransportEvent::Message(Message::Response(JsonRpcResponse {
        id,
        result: Some(result),
        error: None,
        jsonrpc: JsonRpcVersion::default(),
    }))
}

#[allow(dead_code)]
pub fn inbound_error_response(id: RequestId, code: i32, message: &str) -> TransportEvent {
    TransportEvent::Message(Message::Response(JsonRpcResponse {
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.to_owned(),
            data: None,
        }),
        jsonrpc: JsonRpcVersion::default(),
    }))
}

/// The id of a sent request, panicking on any other message kind.
pub fn request_id(message: &Message) -> RequestId {
    match message {
        Message::Request(req) => req.id.clone(),
        other => panic!("expected request, got {:?}", other),
    }
}
