//! Anthropic Messages API backend.

use crate::catalog::ToolConfig;
use crate::model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, StopReason, ToolStatus,
    ToolUse, Usage,
};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20";

/// Authentication mode for Anthropic API.
#[derive(Debug, Clone)]
pub enum AnthropicAuth {
    /// Standard API key authentication.
    ApiKey(String),
    /// OAuth access token, sent as a bearer token.
    Oauth(String),
}

impl std::fmt::Display for AnthropicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "api_key"),
            Self::Oauth(_) => write!(f, "oauth"),
        }
    }
}

impl AnthropicAuth {
    fn apply_headers(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => req.header("x-api-key", key),
            Self::Oauth(token) => req
                .header("Authorization", format!("Bearer {token}"))
                .header("anthropic-beta", OAUTH_BETA_HEADER),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

/// Borrowed view of a transcript message; content is always block form.
#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: Role,
    content: Vec<ApiContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock<'a> {
    Text {
        text: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: &'a Value,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: &'a str,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    endpoint: String,
}

impl AnthropicBackendBuilder {
    pub fn new(auth: AnthropicAuth, model: impl Into<String>) -> Self {
        Self {
            auth,
            model: model.into(),
            max_tokens: 4096,
            endpoint: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Override the Messages API URL (proxies, gateways).
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn build(self) -> AnthropicBackend {
        AnthropicBackend {
            client: reqwest::Client::new(),
            auth: self.auth,
            model: self.model,
            max_tokens: self.max_tokens,
            endpoint: self.endpoint,
        }
    }
}

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    endpoint: String,
}

impl AnthropicBackend {
    pub fn builder(auth: AnthropicAuth, model: impl Into<String>) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(auth, model)
    }

    fn message_to_api(msg: &Message) -> ApiMessage<'_> {
        let content = msg
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ApiContentBlock::Text { text },
                Part::ToolUse(call) => ApiContentBlock::ToolUse {
                    id: &call.id,
                    name: &call.name,
                    input: &call.input,
                },
                Part::ToolResult(result) => ApiContentBlock::ToolResult {
                    tool_use_id: &result.tool_use_id,
                    content: &result.content,
                    is_error: result.status == ToolStatus::Error,
                },
            })
            .collect();

        ApiMessage {
            role: msg.role,
            content,
        }
    }

    fn tools_to_api(config: &ToolConfig) -> Vec<ApiTool<'_>> {
        config
            .specs()
            .map(|spec| ApiTool {
                name: &spec.name,
                description: &spec.description,
                input_schema: &spec.input_schema.json,
            })
            .collect()
    }

    fn response_to_message(blocks: Vec<ApiResponseBlock>) -> Message {
        let parts: Vec<Part> = blocks
            .into_iter()
            .filter_map(|block| match block {
                ApiResponseBlock::Text { text } => Some(Part::Text(text)),
                ApiResponseBlock::ToolUse { id, name, input } => {
                    Some(Part::ToolUse(ToolUse { id, name, input }))
                }
                ApiResponseBlock::Unknown => None,
            })
            .collect();

        Message {
            role: Role::Assistant,
            parts,
        }
    }
}

impl std::fmt::Display for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({}, auth={})", self.model, self.auth)
    }
}

impl Backend for AnthropicBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let api_request = ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: request.messages.iter().map(Self::message_to_api).collect(),
            system: request.system,
            tools: Self::tools_to_api(request.tool_config),
        };

        let req = self
            .client
            .post(&self.endpoint)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "application/json");

        let response = self
            .auth
            .apply_headers(req)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let stop_reason = api_response
            .stop_reason
            .as_deref()
            .map(StopReason::from_wire)
            .ok_or_else(|| ModelError::InvalidResponse("missing stop_reason".into()))?;
        Ok(ModelResponse {
            stop_reason,
            message: Self::response_to_message(api_response.content),
            usage: Usage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::project_tools;
    use crate::model::ToolResult;
    use serde_json::json;

    #[test]
    fn auth_display() {
        let api = AnthropicAuth::ApiKey("test".into());
        let oauth = AnthropicAuth::Oauth("test".into());
        assert_eq!(api.to_string(), "api_key");
        assert_eq!(oauth.to_string(), "oauth");
    }

    #[test]
    fn tool_turns_to_wire() {
        let assistant = Message {
            role: Role::Assistant,
            parts: vec![Part::ToolUse(ToolUse {
                id: "toolu_1".into(),
                name: "add_two_numbers".into(),
                input: json!({"a": 4, "b": 5}),
            })],
        };
        let user = Message::tool_results([ToolResult::error("toolu_1", "boom")]);

        let wire = serde_json::to_value(AnthropicBackend::message_to_api(&assistant)).unwrap();
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["content"][0]["type"], "tool_use");
        assert_eq!(wire["content"][0]["id"], "toolu_1");

        let wire = serde_json::to_value(AnthropicBackend::message_to_api(&user)).unwrap();
        assert_eq!(
            wire["content"][0],
            json!({"type": "tool_result", "tool_use_id": "toolu_1", "content": "boom", "is_error": true})
        );

        let user = Message::user("hi");
        let wire = serde_json::to_value(AnthropicBackend::message_to_api(&user)).unwrap();
        assert_eq!(
            wire,
            json!({"role": "user", "content": [{"type": "text", "text": "hi"}]})
        );
    }

    #[test]
    fn tools_reprojected_from_tool_config() {
        let config = project_tools(vec![mcp::Tool {
            name: "add_two_numbers".into(),
            title: None,
            description: Some("Tool to add two numbers".into()),
            input_schema: json!({"type": "object", "properties": {"a": {"type": "number"}}}),
        }]);
        let wire = serde_json::to_value(AnthropicBackend::tools_to_api(&config)).unwrap();
        assert_eq!(wire[0]["name"], "add_two_numbers");
        assert_eq!(wire[0]["input_schema"]["properties"]["a"]["type"], "number");
    }

    #[test]
    fn response_parsing() {
        let body = json!({
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Adding."},
                {"type": "tool_use", "id": "toolu_1", "name": "add_two_numbers", "input": {"a": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let response: ApiResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
        let message = AnthropicBackend::response_to_message(response.content);
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.tool_uses()[0].id, "toolu_1");
    }
}
