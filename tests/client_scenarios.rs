//! End-to-end client behavior over an in-memory transport: the
//! initialize handshake, change-notification fan-out, roots and sampling
//! dispatch, and timeout handling.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use url::Url;

use common::*;
use mcp_session::client::Client;
use mcp_session::errors::Error;
use mcp_session::session::SessionState;
use mcp_session::transport::Message;
use mcp_session::types::{Root, Tool};

fn initialize_result_value(protocol_version: &str) -> serde_json::Value {
    json!({
        "protocolVersion": protocol_version,
        "capabilities": {"tools": {"listChanged": true}},
        "serverInfo": {"name": "test-server", "version": "0.1.0"}
    })
}

/// Drives the initialize handshake against the mock peer, replying with
/// the given protocol version.
async fn run_handshake(
    client: &Client,
    transport: &Arc<MockTransport>,
    protocol_version: &'static str,
) -> mcp_session::Result<()> {
    let initializer = client.clone();
    let handle = tokio::spawn(async move { initializer.initialize().await });

    let sent = transport.wait_for_sent(1).await;
    let id = request_id(&sent[0]);
    transport
        .inject(inbound_response(id, initialize_result_value(protocol_version)))
        .await;

    handle.await.unwrap().map(|_| ())
}

#[tokio::test]
async fn initialize_round_trip_ends_with_initialized_notification() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder().connect(transport.clone()).await.unwrap();

    run_handshake(&client, &transport, "2025-03-26")
        .await
        .unwrap();

    let sent = transport.wait_for_sent(2).await;
    match &sent[0] {
        Message::Request(req) => {
            assert_eq!(req.method, "initialize");
            assert_eq!(req.id.to_string(), "1");
            let params = req.params.as_ref().unwrap();
            assert_eq!(params["protocolVersion"], "2025-03-26");
        }
        other => panic!("expected initialize request, got {:?}", other),
    }
    // The last sent message of a successful handshake is the
    // initialized notification.
    match sent.last().unwrap() {
        Message::Notification(n) => assert_eq!(n.method, "notifications/initialized"),
        other => panic!("expected notification, got {:?}", other),
    }
    assert_eq!(client.session().state().await, SessionState::Initialized);
}

#[tokio::test]
async fn version_mismatch_fails_without_initialized_notification() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder().connect(transport.clone()).await.unwrap();

    let result = run_handshake(&client, &transport, "1999-01-01").await;
    match result {
        Err(Error::VersionMismatch { actual, .. }) => assert_eq!(actual, "1999-01-01"),
        other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
    }

    // Only the initialize request went out; no notification followed.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(client.session().state().await, SessionState::Connected);
}

#[tokio::test]
async fn tools_change_notification_fans_out_to_consumers() {
    let seen: Arc<Mutex<Vec<Vec<Tool>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_consumer = seen.clone();

    let transport = Arc::new(MockTransport::new());
    let client = Client::builder()
        .on_tools_list_changed(move |tools| {
            seen_in_consumer.lock().unwrap().push(tools);
            Ok(())
        })
        .connect(transport.clone())
        .await
        .unwrap();

    run_handshake(&client, &transport, "2025-03-26")
        .await
        .unwrap();

    transport
        .inject(inbound_notification("notifications/tools/list_changed"))
        .await;

    // The client refreshes with a tools/list request.
    let sent = transport.wait_for_sent(3).await;
    let refresh = sent.last().unwrap();
    match refresh {
        Message::Request(req) => {
            assert_eq!(req.method, "tools/list");
            assert_eq!(req.id.to_string(), "2");
        }
        other => panic!("expected tools/list request, got {:?}", other),
    }
    transport
        .inject(inbound_response(
            request_id(refresh),
            json!({"tools": [{"name": "t1", "description": "d", "inputSchema": "{}"}]}),
        ))
        .await;

    for _ in 0..100 {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "consumer must run exactly once");
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].name, "t1");
}

#[tokio::test]
async fn roots_list_request_is_served_from_registered_roots() {
    let transport = Arc::new(MockTransport::new());
    let _client = Client::builder()
        .with_root(Root {
            uri: Url::parse("file:///x").unwrap(),
            name: Some("r".to_string()),
        })
        .connect(transport.clone())
        .await
        .unwrap();

    transport
        .inject(inbound_request("7", "roots/list", None))
        .await;

    let sent = transport.wait_for_sent(1).await;
    match &sent[0] {
        Message::Response(resp) => {
            assert_eq!(resp.id.to_string(), "7");
            assert!(resp.error.is_none());
            let result = resp.result.as_ref().unwrap();
            assert_eq!(
                result["roots"],
                json!([{"uri": "file:///x", "name": "r"}])
            );
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn sampling_without_capability_is_method_not_found() {
    let transport = Arc::new(MockTransport::new());
    let _client = Client::builder().connect(transport.clone()).await.unwrap();

    transport
        .inject(inbound_request(
            "9",
            "sampling/createMessage",
            Some(json!({"messages": [], "maxTokens": 10})),
        ))
        .await;

    let sent = transport.wait_for_sent(1).await;
    match &sent[0] {
        Message::Response(resp) => {
            assert_eq!(resp.id.to_string(), "9");
            assert!(resp.result.is_none());
            let error = resp.error.as_ref().unwrap();
            assert_eq!(error.code, -32601);
            assert_eq!(error.message, "Method not found: sampling/createMessage");
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn sampling_handler_answers_create_message() {
    use mcp_session::types::{Content, CreateMessageResult, Role};

    let transport = Arc::new(MockTransport::new());
    let _client = Client::builder()
        .with_sampling_handler(|request| {
            Box::pin(async move {
                assert_eq!(request.max_tokens, 10);
                Ok(CreateMessageResult {
                    role: Role::Assistant,
                    content: Content::text("generated"),
                    model: "test-model".to_string(),
                    stop_reason: Some("endTurn".to_string()),
                })
            })
        })
        .connect(transport.clone())
        .await
        .unwrap();

    transport
        .inject(inbound_request(
            "4",
            "sampling/createMessage",
            Some(json!({"messages": [], "maxTokens": 10})),
        ))
        .await;

    let sent = transport.wait_for_sent(1).await;
    match &sent[0] {
        Message::Response(resp) => {
            assert!(resp.error.is_none());
            let result = resp.result.as_ref().unwrap();
            assert_eq!(result["model"], "test-model");
            assert_eq!(result["content"]["text"], "generated");
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn sampling_capability_without_handler_is_a_configuration_error() {
    use mcp_session::types::ClientCapabilities;

    let transport = Arc::new(MockTransport::new());
    let result = Client::builder()
        .set_capabilities(ClientCapabilities {
            sampling: Some(json!({})),
            ..Default::default()
        })
        .connect(transport)
        .await;
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn ping_times_out_and_late_response_is_dropped() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder()
        .request_timeout(Duration::from_millis(100))
        .connect(transport.clone())
        .await
        .unwrap();

    run_handshake(&client, &transport, "2025-03-26")
        .await
        .unwrap();

    let pinger = client.clone();
    let handle = tokio::spawn(async move { pinger.ping().await });

    // The peer never answers; the deadline must fire well before 200 ms
    // has passed.
    let result = tokio::time::timeout(Duration::from_millis(200), handle)
        .await
        .expect("ping future must complete by the deadline")
        .unwrap();
    assert!(matches!(result, Err(Error::Timeout)));

    // A response arriving later finds no pending entry and is dropped
    // without disturbing anything that follows.
    let sent = transport.sent().await;
    let stale_id = request_id(sent.last().unwrap());
    transport
        .inject(inbound_response(stale_id, json!({"late": true})))
        .await;

    let pinger = client.clone();
    let handle = tokio::spawn(async move { pinger.ping().await });
    let sent = transport.wait_for_sent(4).await;
    let id = request_id(sent.last().unwrap());
    transport.inject(inbound_response(id, json!({}))).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn roots_mutations_gate_on_capability_and_uniqueness() {
    use mcp_session::types::{ClientCapabilities, RootsCapability};

    // Without the roots capability both mutations fail fast.
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder().connect(transport.clone()).await.unwrap();
    let root = Root {
        uri: Url::parse("file:///x").unwrap(),
        name: Some("r".to_string()),
    };
    assert!(matches!(
        client.add_root(root.clone()).await,
        Err(Error::CapabilityMissing("roots"))
    ));
    assert!(matches!(
        client.remove_root(&root.uri).await,
        Err(Error::CapabilityMissing("roots"))
    ));

    // With listChanged declared, each mutation emits the hint.
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder()
        .set_capabilities(ClientCapabilities {
            roots: Some(RootsCapability {
                list_changed: Some(true),
            }),
            ..Default::default()
        })
        .connect(transport.clone())
        .await
        .unwrap();
    run_handshake(&client, &transport, "2025-03-26")
        .await
        .unwrap();

    client.add_root(root.clone()).await.unwrap();
    assert!(matches!(
        client.add_root(root.clone()).await,
        Err(Error::AlreadyExists(_))
    ));
    client.remove_root(&root.uri).await.unwrap();
    assert!(matches!(
        client.remove_root(&root.uri).await,
        Err(Error::NotFound(_))
    ));

    let notifications: Vec<String> = transport
        .sent()
        .await
        .into_iter()
        .filter_map(|message| match message {
            Message::Notification(n) if n.method == "notifications/roots/list_changed" => {
                Some(n.method)
            }
            _ => None,
        })
        .collect();
    assert_eq!(notifications.len(), 2, "one hint per successful mutation");
}

#[tokio::test]
async fn typed_feature_calls_decode_results() {
    let transport = Arc::new(MockTransport::new());
    let client = Client::builder().connect(transport.clone()).await.unwrap();
    run_handshake(&client, &transport, "2025-03-26")
        .await
        .unwrap();

    let lister = client.clone();
    let handle = tokio::spawn(async move { lister.list_tools(None).await });
    let sent = transport.wait_for_sent(3).await;
    transport
        .inject(inbound_response(
            request_id(sent.last().unwrap()),
            json!({"tools": [{"name": "echo", "inputSchema": {}}], "nextCursor": "page2"}),
        ))
        .await;
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.tools[0].name, "echo");
    assert_eq!(result.next_cursor.as_deref(), Some("page2"));

    let reader = client.clone();
    let handle = tokio::spawn(async move {
        reader
            .read_resource(Url::parse("file:///notes.txt").unwrap())
            .await
    });
    let sent = transport.wait_for_sent(4).await;
    transport
        .inject(inbound_response(
            request_id(sent.last().unwrap()),
            json!({"contents": [{"uri": "file:///notes.txt", "text": "hello"}]}),
        ))
        .await;
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.contents[0].text.as_deref(), Some("hello"));
}
