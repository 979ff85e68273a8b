//! Tool host trait.

use mcp::{CallToolResult, Session, Tool};
use serde_json::Value;
use std::future::Future;

/// Source of tools for the conversation loop.
///
/// This is the boundary between the model loop and side effects; the MCP
/// [`Session`] is the production implementation.
pub trait ToolHost: Send + Sync {
    /// Fetch the current tool catalog.
    fn list_tools(&self) -> impl Future<Output = mcp::Result<Vec<Tool>>> + Send;

    /// Invoke a tool with the model-supplied input.
    fn call_tool(
        &self,
        name: &str,
        input: Value,
    ) -> impl Future<Output = mcp::Result<CallToolResult>> + Send;
}

impl ToolHost for Session {
    async fn list_tools(&self) -> mcp::Result<Vec<Tool>> {
        Session::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, input: Value) -> mcp::Result<CallToolResult> {
        let arguments = match input {
            Value::Null => None,
            other => Some(other),
        };
        Session::call_tool(self, name, arguments).await
    }
}
