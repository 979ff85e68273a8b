//! Interpretation of tool call payloads.
//!
//! Tools answer with one text block holding a JSON object:
//! `{"tool_run_status": "success", "result": ...}`. Anything else is a
//! failure the model gets to see.

use crate::model::ToolResult;
use mcp::CallToolResult;
use serde_json::Value;

const SUCCESS: &str = "success";

/// What a tool call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Interpret a `tools/call` result.
    pub fn from_call_result(result: &CallToolResult) -> Self {
        let Some(text) = result.first_text() else {
            return Self::Failure("tool returned no text content".to_string());
        };
        if result.is_error {
            return Self::Failure(text.to_string());
        }

        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => return Self::Failure(format!("malformed tool payload: {e}")),
        };

        match payload.get("tool_run_status").and_then(Value::as_str) {
            Some(SUCCESS) => Self::Success(payload.get("result").cloned().unwrap_or(Value::Null)),
            Some(status) => {
                let detail = payload.get("result").or_else(|| payload.get("error"));
                Self::Failure(match detail {
                    Some(detail) => format!("tool run status {status}: {}", display_value(detail)),
                    None => format!("tool run status {status}"),
                })
            }
            None => Self::Failure("tool payload has no tool_run_status".to_string()),
        }
    }

    /// Convert into the tool result appended to the transcript.
    pub fn into_tool_result(self, tool_use_id: impl Into<String>) -> ToolResult {
        match self {
            Self::Success(value) => {
                ToolResult::success(tool_use_id, format!("Result is {}", display_value(&value)))
            }
            Self::Failure(message) => ToolResult::error(tool_use_id, message),
        }
    }
}

impl std::fmt::Display for ToolOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(value) => f.write_str(&display_value(value)),
            Self::Failure(message) => write!(f, "tool failed: {message}"),
        }
    }
}

/// JSON strings are shown unquoted.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
