//! # MCP Client
//!
//! Client-side facade over a [`Session`]. The facade owns the
//! `initialize` handshake, exposes typed one-liners for the tools,
//! resources, and prompts features, serves the client-side features the
//! server may call back into (roots introspection and sampling), and
//! fans `*/list_changed` hints out to registered consumers.
//!
//! All configuration happens on the [`ClientBuilder`]; once
//! [`connect`](ClientBuilder::connect) runs, the handler set is frozen.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::session::{Session, SessionBuilder};
use crate::transport::{unmarshal, Transport};
use crate::types::{
    CallToolRequest, CallToolResult, ClientCapabilities, CreateMessageRequest, CreateMessageResult,
    GetPromptRequest, GetPromptResult, Implementation, InitializeRequest, InitializeResult,
    ListPromptsResult, ListRequest, ListResourceTemplatesResult, ListResourcesResult,
    ListRootsResult, ListToolsResult, Prompt, ProtocolVersion, ReadResourceRequest,
    ReadResourceResult, Resource, Root, SubscribeRequest, Tool, LATEST_PROTOCOL_VERSION,
};

/// Async handler invoked when the server requests sampling via
/// `sampling/createMessage`.
pub type SamplingHandler = Box<
    dyn Fn(CreateMessageRequest) -> Pin<Box<dyn Future<Output = anyhow::Result<CreateMessageResult>> + Send>>
        + Send
        + Sync,
>;

/// Consumer invoked with a freshly fetched feature list after the server
/// hints that the list changed.
pub type ListConsumer<T> = Box<dyn Fn(Vec<T>) -> anyhow::Result<()> + Send + Sync>;

/// An MCP client bound to one session.
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    session: Session,
    protocol_version: ProtocolVersion,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    roots: Arc<Mutex<HashMap<String, Root>>>,
    initialize_result: Arc<RwLock<Option<InitializeResult>>>,
}

impl Client {
    /// Creates a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The underlying session, for direct request/notify access.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Initializes the connection with the MCP server.
    ///
    /// Sends `initialize` with this client's capabilities and info. If
    /// the server replies with an unexpected protocol version the future
    /// completes with [`Error::VersionMismatch`] and no
    /// `notifications/initialized` is sent; otherwise the notification
    /// goes out and the session becomes initialized.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let request = InitializeRequest {
            protocol_version: self.protocol_version.as_str().to_string(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        };
        let value = self
            .session
            .request("initialize", Some(serde_json::to_value(request)?))
            .await?;
        let result: InitializeResult = unmarshal(value)?;

        if result.protocol_version != self.protocol_version.as_str() {
            return Err(Error::VersionMismatch {
                expected: self.protocol_version.as_str().to_string(),
                actual: result.protocol_version,
            });
        }

        *self.initialize_result.write().await = Some(result.clone());
        debug!(
            "initialized with protocol version {}",
            result.protocol_version
        );
        self.session
            .notify("notifications/initialized", None)
            .await?;

        Ok(result)
    }

    /// The server's `initialize` result, if the handshake has completed.
    pub async fn initialize_result(&self) -> Option<InitializeResult> {
        self.initialize_result.read().await.clone()
    }

    /// Sends a liveness probe.
    pub async fn ping(&self) -> Result<serde_json::Value> {
        self.session.request("ping", None).await
    }

    /// Lists tools available on the server.
    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.list("tools/list", cursor).await
    }

    /// Calls a tool on the server.
    pub async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult> {
        let value = self
            .session
            .request("tools/call", Some(serde_json::to_value(request)?))
            .await?;
        Ok(unmarshal(value)?)
    }

    /// Lists resources available on the server.
    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.list("resources/list", cursor).await
    }

    /// Lists resource templates available on the server.
    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult> {
        self.list("resources/templates/list", cursor).await
    }

    /// Reads a resource from the server.
    pub async fn read_resource(&self, uri: url::Url) -> Result<ReadResourceResult> {
        let request = ReadResourceRequest { uri };
        let value = self
            .session
            .request("resources/read", Some(serde_json::to_value(request)?))
            .await?;
        Ok(unmarshal(value)?)
    }

    /// Subscribes to update notifications for a resource.
    pub async fn subscribe_resource(&self, uri: url::Url) -> Result<()> {
        let request = SubscribeRequest { uri };
        self.session
            .request("resources/subscribe", Some(serde_json::to_value(request)?))
            .await?;
        Ok(())
    }

    /// Cancels a resource subscription.
    pub async fn unsubscribe_resource(&self, uri: url::Url) -> Result<()> {
        let request = SubscribeRequest { uri };
        self.session
            .request(
                "resources/unsubscribe",
                Some(serde_json::to_value(request)?),
            )
            .await?;
        Ok(())
    }

    /// Lists prompts available on the server.
    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        self.list("prompts/list", cursor).await
    }

    /// Expands a prompt on the server.
    pub async fn get_prompt(&self, request: GetPromptRequest) -> Result<GetPromptResult> {
        let value = self
            .session
            .request("prompts/get", Some(serde_json::to_value(request)?))
            .await?;
        Ok(unmarshal(value)?)
    }

    /// Advertises a new root to the server.
    ///
    /// Fails with [`Error::CapabilityMissing`] when the client was built
    /// without the roots capability and [`Error::AlreadyExists`] when a
    /// root with this URI is already registered. Emits
    /// `notifications/roots/list_changed` iff the capability declared
    /// `listChanged`.
    pub async fn add_root(&self, root: Root) -> Result<()> {
        let notify = self.roots_list_changed_enabled()?;
        {
            let mut roots = self.roots.lock().await;
            if roots.contains_key(root.uri.as_str()) {
                return Err(Error::AlreadyExists(root.uri.to_string()));
            }
            roots.insert(root.uri.to_string(), root);
        }
        if notify {
            self.roots_list_changed_notification().await?;
        }
        Ok(())
    }

    /// Withdraws a root.
    ///
    /// Fails with [`Error::NotFound`] when no root with this URI is
    /// registered; capability and notification behavior match
    /// [`add_root`](Client::add_root).
    pub async fn remove_root(&self, uri: &url::Url) -> Result<()> {
        let notify = self.roots_list_changed_enabled()?;
        {
            let mut roots = self.roots.lock().await;
            if roots.remove(uri.as_str()).is_none() {
                return Err(Error::NotFound(uri.to_string()));
            }
        }
        if notify {
            self.roots_list_changed_notification().await?;
        }
        Ok(())
    }

    /// Sends `notifications/roots/list_changed` unconditionally.
    pub async fn roots_list_changed_notification(&self) -> Result<()> {
        self.session
            .notify("notifications/roots/list_changed", None)
            .await
    }

    /// Closes the session gracefully.
    pub async fn close_gracefully(&self) -> Result<()> {
        self.session.close_gracefully().await
    }

    /// Closes the session immediately.
    pub async fn close(&self) {
        self.session.close().await
    }

    fn roots_list_changed_enabled(&self) -> Result<bool> {
        let caps = self
            .capabilities
            .roots
            .as_ref()
            .ok_or(Error::CapabilityMissing("roots"))?;
        Ok(caps.list_changed.unwrap_or(false))
    }

    async fn list<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        cursor: Option<String>,
    ) -> Result<T> {
        let request = ListRequest { cursor, meta: None };
        let value = self
            .session
            .request(method, Some(serde_json::to_value(request)?))
            .await?;
        Ok(unmarshal(value)?)
    }
}

/// Builder for creating configured [`Client`] instances.
pub struct ClientBuilder {
    request_timeout: Duration,
    protocol_version: ProtocolVersion,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    roots: Vec<Root>,
    sampling_handler: Option<SamplingHandler>,
    tools_consumers: Vec<ListConsumer<Tool>>,
    resources_consumers: Vec<ListConsumer<Resource>>,
    prompts_consumers: Vec<ListConsumer<Prompt>>,
}

impl ClientBuilder {
    /// Creates a new client builder with default settings.
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_millis(crate::session::DEFAULT_REQUEST_TIMEOUT_MSEC),
            protocol_version: LATEST_PROTOCOL_VERSION,
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ClientCapabilities::default(),
            roots: Vec::new(),
            sampling_handler: None,
            tools_consumers: Vec::new(),
            resources_consumers: Vec::new(),
            prompts_consumers: Vec::new(),
        }
    }

    /// Sets the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the protocol version for the client.
    pub fn set_protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Sets the client information.
    pub fn set_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    /// Sets the client capabilities.
    pub fn set_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Adds an initial root. Providing any root implicitly declares the
    /// roots capability.
    pub fn with_root(mut self, root: Root) -> Self {
        self.roots.push(root);
        self
    }

    /// Installs the sampling handler, implicitly declaring the sampling
    /// capability.
    pub fn with_sampling_handler(
        mut self,
        handler: impl Fn(CreateMessageRequest) -> Pin<Box<dyn Future<Output = anyhow::Result<CreateMessageResult>> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.sampling_handler = Some(Box::new(handler));
        self
    }

    /// Registers a consumer invoked with the refreshed tool list after
    /// the server hints `notifications/tools/list_changed`.
    pub fn on_tools_list_changed(
        mut self,
        consumer: impl Fn(Vec<Tool>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.tools_consumers.push(Box::new(consumer));
        self
    }

    /// Registers a consumer invoked with the refreshed resource list
    /// after the server hints `notifications/resources/list_changed`.
    pub fn on_resources_list_changed(
        mut self,
        consumer: impl Fn(Vec<Resource>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.resources_consumers.push(Box::new(consumer));
        self
    }

    /// Registers a consumer invoked with the refreshed prompt list after
    /// the server hints `notifications/prompts/list_changed`.
    pub fn on_prompts_list_changed(
        mut self,
        consumer: impl Fn(Vec<Prompt>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.prompts_consumers.push(Box::new(consumer));
        self
    }

    /// Validates the configuration, wires up the session handlers, and
    /// connects over `transport`.
    ///
    /// Fails with [`Error::Configuration`] when the declared
    /// capabilities and the provided handlers disagree (e.g. a sampling
    /// capability without a sampling handler) or when the initial roots
    /// contain duplicate URIs.
    pub async fn connect(mut self, transport: Arc<dyn Transport>) -> Result<Client> {
        if self.capabilities.sampling.is_some() && self.sampling_handler.is_none() {
            return Err(Error::Configuration(
                "sampling capability declared without a sampling handler".to_string(),
            ));
        }
        if self.sampling_handler.is_some() && self.capabilities.sampling.is_none() {
            self.capabilities.sampling = Some(json!({}));
        }
        if !self.roots.is_empty() && self.capabilities.roots.is_none() {
            self.capabilities.roots = Some(Default::default());
        }

        let mut roots = HashMap::new();
        for root in self.roots.drain(..) {
            if roots.insert(root.uri.to_string(), root.clone()).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate root uri: {}",
                    root.uri
                )));
            }
        }
        let roots = Arc::new(Mutex::new(roots));

        // Handlers are installed before the session exists; they reach it
        // through this cell, which is filled before the transport starts.
        let session_cell: Arc<OnceLock<Session>> = Arc::new(OnceLock::new());

        let mut session_builder = SessionBuilder::new()
            .request_timeout(self.request_timeout)
            .request_handler("ping", |_: serde_json::Value| {
                Box::pin(async { Ok(json!({})) })
            });

        if self.capabilities.roots.is_some() {
            let roots_for_list = roots.clone();
            session_builder =
                session_builder.request_handler("roots/list", move |_: serde_json::Value| {
                    let roots = roots_for_list.clone();
                    Box::pin(async move {
                        let roots = roots.lock().await;
                        Ok(ListRootsResult {
                            roots: roots.values().cloned().collect(),
                        })
                    })
                });
        }

        if let Some(sampling) = self.sampling_handler.take() {
            session_builder = session_builder.request_handler(
                "sampling/createMessage",
                move |request: CreateMessageRequest| sampling(request),
            );
        }

        session_builder = session_builder.notification_handler(
            "notifications/tools/list_changed",
            list_changed_handler(
                session_cell.clone(),
                "tools/list",
                Arc::new(self.tools_consumers),
                |value| Ok(unmarshal::<ListToolsResult>(value)?.tools),
            ),
        );
        session_builder = session_builder.notification_handler(
            "notifications/resources/list_changed",
            list_changed_handler(
                session_cell.clone(),
                "resources/list",
                Arc::new(self.resources_consumers),
                |value| Ok(unmarshal::<ListResourcesResult>(value)?.resources),
            ),
        );
        session_builder = session_builder.notification_handler(
            "notifications/prompts/list_changed",
            list_changed_handler(
                session_cell.clone(),
                "prompts/list",
                Arc::new(self.prompts_consumers),
                |value| Ok(unmarshal::<ListPromptsResult>(value)?.prompts),
            ),
        );

        let session = session_builder.build(transport);
        let _ = session_cell.set(session.clone());
        session.start().await?;

        Ok(Client {
            session,
            protocol_version: self.protocol_version,
            client_info: self.client_info,
            capabilities: self.capabilities,
            roots,
            initialize_result: Arc::new(RwLock::new(None)),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the notification handler for one `*/list_changed` feature.
///
/// Bursts are coalesced: while one `*/list` refresh is in flight,
/// further hints for the same feature are dropped. Consumer errors are
/// logged and swallowed.
fn list_changed_handler<T>(
    session_cell: Arc<OnceLock<Session>>,
    list_method: &'static str,
    consumers: Arc<Vec<ListConsumer<T>>>,
    extract: fn(serde_json::Value) -> anyhow::Result<Vec<T>>,
) -> impl Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
       + Send
       + Sync
       + 'static
where
    T: Clone + Send + Sync + 'static,
{
    let in_flight = Arc::new(AtomicBool::new(false));
    move |_: serde_json::Value| {
        let session_cell = session_cell.clone();
        let consumers = consumers.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            if in_flight.swap(true, Ordering::SeqCst) {
                debug!("coalescing {} refresh, one already in flight", list_method);
                return Ok(());
            }
            let fetched = async {
                let session = session_cell
                    .get()
                    .ok_or_else(|| anyhow::anyhow!("session not ready"))?;
                let request = ListRequest::default();
                let value = session
                    .request(list_method, Some(serde_json::to_value(request)?))
                    .await?;
                extract(value)
            }
            .await;
            in_flight.store(false, Ordering::SeqCst);

            let list = fetched?;
            for consumer in consumers.iter() {
                if let Err(e) = consumer(list.clone()) {
                    tracing::error!("{} consumer failed: {}", list_method, e);
                }
            }
            Ok(())
        })
    }
}
