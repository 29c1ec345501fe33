//! # MCP Server
//!
//! Server-side facade over a [`Session`]. A server registers tools,
//! resources, resource templates, and prompts on a [`ServerBuilder`];
//! connecting wires the feature dispatchers into the session's handler
//! map, after which the server answers the standard `tools/*`,
//! `resources/*`, and `prompts/*` requests and tracks the peer's
//! initialization state.
//!
//! The server can also call back into the client (roots introspection
//! and sampling), gated on the capabilities the client declared during
//! the handshake.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use crate::errors::{Error, Result};
use crate::session::{Session, SessionBuilder, DEFAULT_REQUEST_TIMEOUT_MSEC};
use crate::tools::{ToolHandler, Tools};
use crate::transport::{unmarshal, Transport};
use crate::types::{
    CallToolRequest, CallToolResult, ClientCapabilities, CreateMessageRequest, CreateMessageResult,
    GetPromptRequest, GetPromptResult, Implementation, InitializeRequest, InitializeResult,
    ListPromptsResult, ListRequest, ListResourceTemplatesResult, ListResourcesResult,
    ListRootsResult, ListToolsResult, Prompt, ProtocolVersion, ReadResourceRequest,
    ReadResourceResult, Resource, ResourceContents, ResourceTemplate, Root, ServerCapabilities,
    SubscribeRequest, Tool, LATEST_PROTOCOL_VERSION,
};

/// Async handler that expands a prompt on request.
pub type PromptHandlerFn = Box<
    dyn Fn(GetPromptRequest) -> Pin<Box<dyn Future<Output = anyhow::Result<GetPromptResult>> + Send>>
        + Send
        + Sync,
>;

/// Consumer invoked with the client's refreshed roots after it hints
/// `notifications/roots/list_changed`.
pub type RootsConsumer = Box<dyn Fn(Vec<Root>) -> anyhow::Result<()> + Send + Sync>;

struct PromptEntry {
    prompt: Prompt,
    f: PromptHandlerFn,
}

struct RegisteredResource {
    resource: Resource,
    contents: ResourceContents,
}

/// Represents the connected MCP client.
///
/// Tracks the capabilities and info the client reported during
/// `initialize` and whether it has confirmed initialization.
#[derive(Clone, Default)]
pub struct ClientConnection {
    /// The capabilities reported by the client
    pub client_capabilities: Option<ClientCapabilities>,
    /// Information about the client implementation
    pub client_info: Option<Implementation>,
    /// Whether the client has completed initialization
    pub initialized: bool,
}

/// An MCP server bound to one session.
#[derive(Clone)]
pub struct Server {
    session: Session,
    connection: Arc<RwLock<ClientConnection>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
}

impl Server {
    /// Creates a new server builder with the given server information.
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(name.into(), version.into())
    }

    /// The underlying session, for direct request/notify access.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Sends a liveness probe to the client.
    pub async fn ping(&self) -> Result<serde_json::Value> {
        self.session.request("ping", None).await
    }

    /// Gets the capabilities the client declared, if it initialized.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.connection.read().ok()?.client_capabilities.clone()
    }

    /// Gets the client implementation info, if it initialized.
    pub fn client_info(&self) -> Option<Implementation> {
        self.connection.read().ok()?.client_info.clone()
    }

    /// Checks if the client has confirmed initialization.
    pub fn is_initialized(&self) -> bool {
        self.connection
            .read()
            .ok()
            .map(|connection| connection.initialized)
            .unwrap_or(false)
    }

    /// Asks the client for its current roots.
    ///
    /// Fails with [`Error::CapabilityMissing`] unless the client
    /// declared the roots capability during the handshake.
    pub async fn list_roots(&self) -> Result<ListRootsResult> {
        self.require_client_capability("roots", |caps| caps.roots.is_some())?;
        let value = self.session.request("roots/list", None).await?;
        Ok(unmarshal(value)?)
    }

    /// Asks the client's host LLM to generate a message.
    ///
    /// Fails with [`Error::CapabilityMissing`] unless the client
    /// declared the sampling capability during the handshake.
    pub async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageResult> {
        self.require_client_capability("sampling", |caps| caps.sampling.is_some())?;
        let value = self
            .session
            .request(
                "sampling/createMessage",
                Some(serde_json::to_value(request)?),
            )
            .await?;
        Ok(unmarshal(value)?)
    }

    /// Hints to the client that the tool list changed.
    pub async fn notify_tools_list_changed(&self) -> Result<()> {
        self.session
            .notify("notifications/tools/list_changed", None)
            .await
    }

    /// Hints to the client that the resource list changed.
    pub async fn notify_resources_list_changed(&self) -> Result<()> {
        self.session
            .notify("notifications/resources/list_changed", None)
            .await
    }

    /// Hints to the client that the prompt list changed.
    pub async fn notify_prompts_list_changed(&self) -> Result<()> {
        self.session
            .notify("notifications/prompts/list_changed", None)
            .await
    }

    /// Notifies the client that a resource it subscribed to changed.
    /// A no-op when the client holds no subscription for `uri`.
    pub async fn notify_resource_updated(&self, uri: &url::Url) -> Result<()> {
        if !self.subscriptions.lock().await.contains(uri.as_str()) {
            return Ok(());
        }
        self.session
            .notify(
                "notifications/resources/updated",
                Some(json!({ "uri": uri.to_string() })),
            )
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

    fn require_client_capability(
        &self,
        name: &'static str,
        check: impl Fn(&ClientCapabilities) -> bool,
    ) -> Result<()> {
        let declared = self
            .client_capabilities()
            .map(|caps| check(&caps))
            .unwrap_or(false);
        if declared {
            Ok(())
        } else {
            Err(Error::CapabilityMissing(name))
        }
    }
}

/// Builder for creating configured [`Server`] instances.
pub struct ServerBuilder {
    request_timeout: Duration,
    protocol_version: ProtocolVersion,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    tools: HashMap<String, ToolHandler>,
    resources: HashMap<String, RegisteredResource>,
    templates: Vec<ResourceTemplate>,
    prompts: HashMap<String, PromptEntry>,
    roots_consumers: Vec<RootsConsumer>,
}

impl ServerBuilder {
    /// Creates a new server builder.
    pub fn new(name: String, version: String) -> Self {
        ServerBuilder {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MSEC),
            protocol_version: LATEST_PROTOCOL_VERSION,
            server_info: Implementation { name, version },
            capabilities: ServerCapabilities::default(),
            instructions: None,
            tools: HashMap::new(),
            resources: HashMap::new(),
            templates: Vec::new(),
            prompts: HashMap::new(),
            roots_consumers: Vec::new(),
        }
    }

    /// Sets the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the protocol version for the server.
    pub fn set_protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Sets the server capabilities.
    pub fn set_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the server instructions advertised during initialization.
    pub fn set_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Registers a tool with the server.
    pub fn register_tool(
        mut self,
        tool: Tool,
        f: impl Fn(CallToolRequest) -> Pin<Box<dyn Future<Output = CallToolResult> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.tools.insert(
            tool.name.clone(),
            ToolHandler {
                tool,
                f: Box::new(f),
            },
        );
        self
    }

    /// Registers a static resource and the contents served for it.
    pub fn register_resource(mut self, resource: Resource, contents: ResourceContents) -> Self {
        self.resources.insert(
            resource.uri.to_string(),
            RegisteredResource { resource, contents },
        );
        self
    }

    /// Registers a resource template.
    pub fn register_resource_template(mut self, template: ResourceTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Registers a prompt and the handler that expands it.
    pub fn register_prompt(
        mut self,
        prompt: Prompt,
        f: impl Fn(GetPromptRequest) -> Pin<Box<dyn Future<Output = anyhow::Result<GetPromptResult>> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.prompts.insert(
            prompt.name.clone(),
            PromptEntry {
                prompt,
                f: Box::new(f),
            },
        );
        self
    }

    /// Registers a consumer invoked with the refreshed roots after the
    /// client hints `notifications/roots/list_changed`.
    pub fn on_roots_list_changed(
        mut self,
        consumer: impl Fn(Vec<Root>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.roots_consumers.push(Box::new(consumer));
        self
    }

    /// Wires the feature dispatchers into a session and connects over
    /// `transport`.
    pub async fn connect(self, transport: Arc<dyn Transport>) -> Result<Server> {
        let connection = Arc::new(RwLock::new(ClientConnection::default()));
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        let tools = Arc::new(Tools::new(self.tools));
        let resources = Arc::new(self.resources);
        let templates = Arc::new(self.templates);
        let prompts = Arc::new(self.prompts);

        let subscribe_supported = self
            .capabilities
            .resources
            .as_ref()
            .and_then(|caps| caps.subscribe)
            .unwrap_or(false);

        let tools_for_list = tools.clone();
        let tools_for_call = tools.clone();
        let conn_for_list = connection.clone();
        let conn_for_call = connection.clone();
        let conn_for_resources = connection.clone();
        let conn_for_templates = connection.clone();
        let conn_for_read = connection.clone();
        let conn_for_subscribe = connection.clone();
        let conn_for_unsubscribe = connection.clone();
        let conn_for_prompts = connection.clone();
        let conn_for_get_prompt = connection.clone();
        let resources_for_list = resources.clone();
        let resources_for_read = resources.clone();
        let prompts_for_list = prompts.clone();
        let prompts_for_get = prompts.clone();
        let subs_for_subscribe = subscriptions.clone();
        let subs_for_unsubscribe = subscriptions.clone();

        // Roots refreshes reach the session through this cell, which is
        // filled before the transport starts.
        let session_cell: Arc<OnceLock<Session>> = Arc::new(OnceLock::new());
        let roots_cell = session_cell.clone();
        let roots_consumers = Arc::new(self.roots_consumers);
        let roots_refresh_in_flight = Arc::new(AtomicBool::new(false));

        let session = SessionBuilder::new()
            .request_timeout(self.request_timeout)
            .request_handler(
                "initialize",
                Self::handle_init(
                    self.protocol_version.clone(),
                    connection.clone(),
                    self.server_info,
                    self.capabilities,
                    self.instructions,
                ),
            )
            .notification_handler(
                "notifications/initialized",
                Self::handle_initialized(connection.clone()),
            )
            .notification_handler(
                "notifications/roots/list_changed",
                move |_: serde_json::Value| {
                    let cell = roots_cell.clone();
                    let consumers = roots_consumers.clone();
                    let in_flight = roots_refresh_in_flight.clone();
                    Box::pin(async move {
                        if in_flight.swap(true, Ordering::SeqCst) {
                            return Ok(());
                        }
                        let fetched = async {
                            let session = cell
                                .get()
                                .ok_or_else(|| anyhow::anyhow!("session not ready"))?;
                            let value = session.request("roots/list", None).await?;
                            Ok::<_, anyhow::Error>(unmarshal::<ListRootsResult>(value)?.roots)
                        }
                        .await;
                        in_flight.store(false, Ordering::SeqCst);

                        let roots = fetched?;
                        for consumer in consumers.iter() {
                            if let Err(e) = consumer(roots.clone()) {
                                tracing::error!("roots consumer failed: {}", e);
                            }
                        }
                        Ok(())
                    })
                },
            )
            .request_handler("ping", |_: serde_json::Value| {
                Box::pin(async { Ok(json!({})) })
            })
            .request_handler("tools/list", move |_: ListRequest| {
                let tools = tools_for_list.clone();
                let conn = conn_for_list.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    Ok(ListToolsResult {
                        tools: tools.list_tools(),
                        next_cursor: None,
                    })
                })
            })
            .request_handler("tools/call", move |req: CallToolRequest| {
                let tools = tools_for_call.clone();
                let conn = conn_for_call.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    tools.call_tool(req).await
                })
            })
            .request_handler("resources/list", move |_: ListRequest| {
                let resources = resources_for_list.clone();
                let conn = conn_for_resources.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    Ok(ListResourcesResult {
                        resources: resources
                            .values()
                            .map(|entry| entry.resource.clone())
                            .collect(),
                        next_cursor: None,
                    })
                })
            })
            .request_handler("resources/templates/list", move |_: ListRequest| {
                let templates = templates.clone();
                let conn = conn_for_templates.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    Ok(ListResourceTemplatesResult {
                        resource_templates: templates.as_ref().clone(),
                        next_cursor: None,
                    })
                })
            })
            .request_handler("resources/read", move |req: ReadResourceRequest| {
                let resources = resources_for_read.clone();
                let conn = conn_for_read.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    let entry = resources
                        .get(req.uri.as_str())
                        .ok_or_else(|| anyhow::anyhow!("Resource not found: {}", req.uri))?;
                    Ok(ReadResourceResult {
                        contents: vec![entry.contents.clone()],
                    })
                })
            })
            .request_handler("resources/subscribe", move |req: SubscribeRequest| {
                let subscriptions = subs_for_subscribe.clone();
                let conn = conn_for_subscribe.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    if !subscribe_supported {
                        anyhow::bail!("resource subscriptions not supported");
                    }
                    subscriptions.lock().await.insert(req.uri.to_string());
                    Ok(json!({}))
                })
            })
            .request_handler("resources/unsubscribe", move |req: SubscribeRequest| {
                let subscriptions = subs_for_unsubscribe.clone();
                let conn = conn_for_unsubscribe.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    if !subscriptions.lock().await.remove(req.uri.as_str()) {
                        anyhow::bail!("No subscription for: {}", req.uri);
                    }
                    Ok(json!({}))
                })
            })
            .request_handler("prompts/list", move |_: ListRequest| {
                let prompts = prompts_for_list.clone();
                let conn = conn_for_prompts.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    Ok(ListPromptsResult {
                        prompts: prompts
                            .values()
                            .map(|entry| entry.prompt.clone())
                            .collect(),
                        next_cursor: None,
                    })
                })
            })
            .request_handler("prompts/get", move |req: GetPromptRequest| {
                let prompts = prompts_for_get.clone();
                let conn = conn_for_get_prompt.clone();
                Box::pin(async move {
                    ensure_initialized(&conn)?;
                    let entry = prompts
                        .get(&req.name)
                        .ok_or_else(|| anyhow::anyhow!("Prompt not found: {}", req.name))?;
                    (entry.f)(req).await
                })
            })
            .build(transport);

        let _ = session_cell.set(session.clone());
        session.start().await?;

        Ok(Server {
            session,
            connection,
            subscriptions,
        })
    }

    /// Helper that builds the `initialize` request handler.
    fn handle_init(
        protocol_version: ProtocolVersion,
        state: Arc<RwLock<ClientConnection>>,
        server_info: Implementation,
        capabilities: ServerCapabilities,
        instructions: Option<String>,
    ) -> impl Fn(
        InitializeRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<InitializeResult>> + Send>>
           + Send
           + Sync
           + 'static {
        move |req| {
            let state = state.clone();
            let server_info = server_info.clone();
            let capabilities = capabilities.clone();
            let instructions = instructions.clone();
            let protocol_version = protocol_version.clone();

            Box::pin(async move {
                let mut state = state
                    .write()
                    .map_err(|_| anyhow::anyhow!("Lock poisoned"))?;
                state.client_capabilities = Some(req.capabilities);
                state.client_info = Some(req.client_info);

                Ok(InitializeResult {
                    protocol_version: protocol_version.as_str().to_string(),
                    capabilities,
                    server_info,
                    instructions,
                })
            })
        }
    }

    /// Helper that builds the `notifications/initialized` handler.
    fn handle_initialized(
        state: Arc<RwLock<ClientConnection>>,
    ) -> impl Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
           + Send
           + Sync
           + 'static {
        move |_| {
            let state = state.clone();
            Box::pin(async move {
                let mut state = state
                    .write()
                    .map_err(|_| anyhow::anyhow!("Lock poisoned"))?;
                state.initialized = true;
                Ok(())
            })
        }
    }
}

fn ensure_initialized(connection: &Arc<RwLock<ClientConnection>>) -> anyhow::Result<()> {
    let initialized = connection
        .read()
        .map_err(|_| anyhow::anyhow!("Lock poisoned"))?
        .initialized;
    if !initialized {
        anyhow::bail!("Client not initialized");
    }
    Ok(())
}
