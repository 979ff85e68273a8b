//! Projection of the MCP tool catalog into the inference API's tool config.

use std::collections::HashSet;

use mcp::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tools::ToolHost;

/// Tool configuration in the Converse API shape:
/// `{"tools": [{"toolSpec": {...}}]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tools: Vec<ToolEntry>,
}

impl ToolConfig {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().map(|entry| &entry.tool_spec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    #[serde(rename = "toolSpec")]
    pub tool_spec: ToolSpec,
}

/// One tool as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: Value,
}

/// Fetch the host's catalog and project it for the model.
///
/// Session state errors pass through untouched; any other listing failure
/// is reported as [`Error::Catalog`].
pub async fn build_tool_config<H: ToolHost>(host: &H) -> Result<ToolConfig> {
    let tools = host.list_tools().await.map_err(|e| match e {
        mcp::Error::InvalidSessionState { .. } | mcp::Error::SessionClosed => Error::Session(e),
        other => Error::Catalog(other.to_string()),
    })?;
    let config = project_tools(tools);
    debug!(tools = config.tools.len(), "built tool config");
    Ok(config)
}

/// Project descriptors in listing order. Later duplicates of a name are
/// dropped.
pub fn project_tools(tools: Vec<Tool>) -> ToolConfig {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(tools.len());

    for tool in tools {
        if !seen.insert(tool.name.clone()) {
            warn!(tool = %tool.name, "duplicate tool name in catalog, keeping the first");
            continue;
        }
        entries.push(ToolEntry {
            tool_spec: project_tool(tool),
        });
    }

    ToolConfig { tools: entries }
}

fn project_tool(tool: Tool) -> ToolSpec {
    let mut properties = Map::new();
    if let Some(declared) = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
    {
        for (name, schema) in declared {
            properties.insert(name.clone(), project_property(name, schema));
        }
    }

    let mut schema = json!({ "type": "object", "properties": properties });
    if let Some(required) = tool.input_schema.get("required").filter(|r| r.is_array()) {
        schema["required"] = required.clone();
    }

    ToolSpec {
        description: tool.description.unwrap_or_default(),
        name: tool.name,
        input_schema: InputSchema { json: schema },
    }
}

/// Keep the declared type; describe the parameter by its title, falling back
/// to its description and then its name.
fn project_property(name: &str, schema: &Value) -> Value {
    let description = ["title", "description"]
        .iter()
        .find_map(|key| schema.get(*key).and_then(Value::as_str))
        .unwrap_or(name);

    let mut projected = Map::new();
    if let Some(kind) = schema.get("type") {
        projected.insert("type".to_string(), kind.clone());
    }
    projected.insert("description".to_string(), Value::String(description.to_string()));
    Value::Object(projected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::CallToolResult;

    fn tool(name: &str, description: Option<&str>, input_schema: Value) -> Tool {
        Tool {
            name: name.to_string(),
            title: None,
            description: description.map(str::to_string),
            input_schema,
        }
    }

    fn calculator() -> Tool {
        tool(
            "add_two_numbers",
            Some("Tool to add two numbers"),
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number", "title": "A"},
                    "b": {"type": "number", "title": "B"},
                    "operation": {"type": "string", "title": "Operation"}
                },
                "required": ["a", "b", "operation"]
            }),
        )
    }

    struct ListingHost(mcp::Result<Vec<Tool>>);

    impl ToolHost for ListingHost {
        async fn list_tools(&self) -> mcp::Result<Vec<Tool>> {
            match &self.0 {
                Ok(tools) => Ok(tools.clone()),
                Err(mcp::Error::SessionClosed) => Err(mcp::Error::SessionClosed),
                Err(e) => Err(mcp::Error::Transport(e.to_string())),
            }
        }

        async fn call_tool(&self, _name: &str, _input: Value) -> mcp::Result<CallToolResult> {
            unreachable!("catalog never calls tools")
        }
    }

    #[test]
    fn projects_calculator_tool() {
        let config = project_tools(vec![calculator()]);
        let wire = serde_json::to_value(&config).unwrap();

        assert_eq!(
            wire,
            json!({
                "tools": [{
                    "toolSpec": {
                        "name": "add_two_numbers",
                        "description": "Tool to add two numbers",
                        "inputSchema": {"json": {
                            "type": "object",
                            "properties": {
                                "a": {"type": "number", "description": "A"},
                                "b": {"type": "number", "description": "B"},
                                "operation": {"type": "string", "description": "Operation"}
                            },
                            "required": ["a", "b", "operation"]
                        }}
                    }
                }]
            })
        );
    }

    #[test]
    fn description_fallbacks() {
        let config = project_tools(vec![tool(
            "divide",
            None,
            json!({
                "properties": {
                    "x": {"type": "number", "description": "Numerator"},
                    "y": {"anyOf": [{"type": "number"}, {"type": "null"}]}
                }
            }),
        )]);
        let spec = config.specs().next().unwrap();
        assert_eq!(spec.description, "");
        let properties = &spec.input_schema.json["properties"];
        assert_eq!(properties["x"]["description"], "Numerator");
        assert_eq!(properties["y"], json!({"description": "y"}));
        assert!(spec.input_schema.json.get("required").is_none());
    }

    #[test]
    fn one_entry_per_tool_and_duplicates_dropped() {
        assert!(project_tools(Vec::new()).is_empty());

        let config = project_tools(vec![
            calculator(),
            tool("ping", Some("first"), json!({})),
            tool("ping", Some("second"), json!({})),
        ]);
        let names: Vec<_> = config.specs().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["add_two_numbers", "ping"]);
        assert_eq!(config.tools[1].tool_spec.description, "first");
    }

    #[tokio::test]
    async fn listing_errors() {
        let closed = ListingHost(Err(mcp::Error::SessionClosed));
        assert!(matches!(
            build_tool_config(&closed).await,
            Err(Error::Session(mcp::Error::SessionClosed))
        ));

        let broken = ListingHost(Err(mcp::Error::Transport("reset".into())));
        assert!(matches!(build_tool_config(&broken).await, Err(Error::Catalog(_))));

        let empty = ListingHost(Ok(Vec::new()));
        assert!(build_tool_config(&empty).await.unwrap().is_empty());
    }
}
