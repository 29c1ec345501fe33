//! Registry and dispatch for server-side tools.
//!
//! Couples each [`Tool`] definition with the async function that
//! implements it. The server facade consults this registry to answer
//! `tools/list` and `tools/call`.

use crate::types::{CallToolRequest, CallToolResult, Tool};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Registry and dispatcher for MCP tools.
pub struct Tools {
    tool_handlers: HashMap<String, ToolHandler>,
}

impl Tools {
    pub(crate) fn new(map: HashMap<String, ToolHandler>) -> Self {
        Self { tool_handlers: map }
    }

    /// Retrieves a tool definition by name.
    pub fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tool_handlers
            .get(name)
            .map(|tool_handler| tool_handler.tool.clone())
    }

    /// Invokes a tool with the given request.
    ///
    /// Fails if no tool with the requested name is registered; tool-level
    /// failures are reported inside the returned [`CallToolResult`].
    pub async fn call_tool(&self, req: CallToolRequest) -> Result<CallToolResult> {
        let handler = self
            .tool_handlers
            .get(&req.name)
            .ok_or_else(|| anyhow::anyhow!("Tool not found: {}", req.name))?;

        Ok((handler.f)(req).await)
    }

    /// Lists all registered tools.
    pub fn list_tools(&self) -> Vec<Tool> {
        self.tool_handlers
            .values()
            .map(|tool_handler| tool_handler.tool.clone())
            .collect()
    }
}

/// Type alias for a tool handler function.
///
/// A tool handler takes a [`CallToolRequest`] and returns a future that
/// resolves to a [`CallToolResult`].
pub type ToolHandlerFn =
    Box<dyn Fn(CallToolRequest) -> Pin<Box<dyn Future<Output = CallToolResult> + Send>> + Send + Sync>;

/// Container for a tool definition and its handler function.
pub(crate) struct ToolHandler {
    /// The tool definition (name, description, input schema)
    pub tool: Tool,
    /// The handler function that implements the tool
    pub f: ToolHandlerFn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> (Tool, ToolHandlerFn) {
        let tool = Tool {
            name: "echo".to_string(),
            description: Some("Echoes its input".to_string()),
            input_schema: json!({"type": "object"}),
        };
        let handler: ToolHandlerFn = Box::new(|req| {
            Box::pin(async move {
                let text = req
                    .arguments
                    .as_ref()
                    .and_then(|args| args.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                CallToolResult::text(text)
            })
        });
        (tool, handler)
    }

    #[tokio::test]
    async fn call_tool_dispatches_to_handler() {
        let (tool, f) = echo_tool();
        let mut map = HashMap::new();
        map.insert(tool.name.clone(), ToolHandler { tool, f });
        let tools = Tools::new(map);

        let result = tools
            .call_tool(CallToolRequest {
                name: "echo".to_string(),
                arguments: Some(HashMap::from([(
                    "message".to_string(),
                    json!("hello"),
                )])),
                meta: None,
            })
            .await
            .unwrap();
        assert_eq!(result.content.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let tools = Tools::new(HashMap::new());
        let result = tools
            .call_tool(CallToolRequest {
                name: "missing".to_string(),
                arguments: None,
                meta: None,
            })
            .await;
        assert!(result.is_err());
    }
}
