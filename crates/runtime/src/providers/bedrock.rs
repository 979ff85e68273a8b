//! Amazon Bedrock Converse API backend.
//!
//! Authenticates with a Bedrock API key sent as a bearer token.

use crate::catalog::ToolConfig;
use crate::model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, StopReason, ToolStatus,
    ToolUse, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_REGION: &str = "us-east-1";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseRequest<'a> {
    messages: Vec<ConverseMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<&'a ToolConfig>,
    inference_config: InferenceConfig,
}

#[derive(Debug, Serialize)]
struct SystemBlock<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ConverseMessage {
    role: Role,
    content: Vec<ConverseBlock>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ConverseBlock {
    Text(String),
    ToolUse(ConverseToolUse),
    ToolResult(ConverseToolResult),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseToolUse {
    tool_use_id: String,
    name: String,
    input: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseToolResult {
    tool_use_id: String,
    content: Vec<TextBlock>,
    status: ToolStatus,
}

#[derive(Debug, Serialize)]
struct TextBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: ConverseOutput,
    stop_reason: String,
    #[serde(default)]
    usage: ConverseUsage,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Vec<ResponseBlock>,
}

/// Output blocks other than text and tool use (reasoning, citations) are
/// skipped.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBlock {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_use: Option<ConverseToolUse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating a Bedrock backend.
#[derive(Debug, Clone)]
pub struct BedrockBackendBuilder {
    api_key: String,
    model: String,
    region: String,
    max_tokens: u32,
    endpoint: Option<String>,
}

impl BedrockBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            region: DEFAULT_REGION.to_string(),
            max_tokens: 4096,
            endpoint: None,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Override the runtime endpoint (VPC endpoints, gateways).
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn build(self) -> BedrockBackend {
        let endpoint = self
            .endpoint
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", self.region));
        let url = format!(
            "{}/model/{}/converse",
            endpoint.trim_end_matches('/'),
            encode_model_id(&self.model)
        );

        BedrockBackend {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            url,
            max_tokens: self.max_tokens,
        }
    }
}

/// Model ids and ARNs contain `:` and `/`, which must not split the path.
fn encode_model_id(model: &str) -> String {
    model.replace(':', "%3A").replace('/', "%2F")
}

/// Bedrock Converse API backend.
pub struct BedrockBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    max_tokens: u32,
}

impl BedrockBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> BedrockBackendBuilder {
        BedrockBackendBuilder::new(api_key, model)
    }

    fn message_to_api(msg: &Message) -> ConverseMessage {
        let content = msg
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ConverseBlock::Text(text.clone()),
                Part::ToolUse(call) => ConverseBlock::ToolUse(ConverseToolUse {
                    tool_use_id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                }),
                Part::ToolResult(result) => ConverseBlock::ToolResult(ConverseToolResult {
                    tool_use_id: result.tool_use_id.clone(),
                    content: vec![TextBlock {
                        text: result.content.clone(),
                    }],
                    status: result.status,
                }),
            })
            .collect();

        ConverseMessage {
            role: msg.role,
            content,
        }
    }

    fn response_to_message(blocks: Vec<ResponseBlock>) -> Message {
        let parts = blocks
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock {
                    tool_use: Some(call),
                    ..
                } => Some(Part::ToolUse(ToolUse {
                    id: call.tool_use_id,
                    name: call.name,
                    input: call.input,
                })),
                ResponseBlock {
                    text: Some(text), ..
                } => Some(Part::Text(text)),
                _ => None,
            })
            .collect();

        Message {
            role: Role::Assistant,
            parts,
        }
    }
}

impl std::fmt::Display for BedrockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bedrock({})", self.model)
    }
}

impl Backend for BedrockBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let api_request = ConverseRequest {
            messages: request.messages.iter().map(Self::message_to_api).collect(),
            system: request
                .system
                .map(|text| vec![SystemBlock { text }])
                .unwrap_or_default(),
            // Converse rejects an empty tool list.
            tool_config: Some(request.tool_config).filter(|config| !config.is_empty()),
            inference_config: InferenceConfig {
                max_tokens: self.max_tokens,
            },
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {body}")));
        }

        let api_response: ConverseResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        Ok(ModelResponse {
            stop_reason: StopReason::from_wire(&api_response.stop_reason),
            message: Self::response_to_message(api_response.output.message.content),
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
    use crate::model::ToolResult;
    use serde_json::json;

    #[test]
    fn url_encodes_model_id() {
        let backend = BedrockBackend::builder("key", "us.anthropic.claude-3-7-sonnet-20250219-v1:0")
            .region("us-west-2")
            .build();
        assert_eq!(
            backend.url,
            "https://bedrock-runtime.us-west-2.amazonaws.com/model/us.anthropic.claude-3-7-sonnet-20250219-v1%3A0/converse"
        );

        let custom = BedrockBackend::builder("key", "m").endpoint("http://localhost:9000/").build();
        assert_eq!(custom.url, "http://localhost:9000/model/m/converse");
    }

    #[test]
    fn request_wire_shape() {
        let messages = vec![
            Message::user("What is 4 plus 5?"),
            Message {
                role: Role::Assistant,
                parts: vec![Part::ToolUse(ToolUse {
                    id: "tooluse_1".into(),
                    name: "add_two_numbers".into(),
                    input: json!({"a": 4, "b": 5}),
                })],
            },
            Message::tool_results([ToolResult::success("tooluse_1", "Result is 9.0")]),
        ];
        let tool_config = ToolConfig::default();
        let request = ConverseRequest {
            messages: messages.iter().map(BedrockBackend::message_to_api).collect(),
            system: vec![SystemBlock { text: "Be brief." }],
            tool_config: Some(&tool_config).filter(|c| !c.is_empty()),
            inference_config: InferenceConfig { max_tokens: 512 },
        };

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire["messages"][0],
            json!({"role": "user", "content": [{"text": "What is 4 plus 5?"}]})
        );
        assert_eq!(wire["messages"][1]["content"][0]["toolUse"]["toolUseId"], "tooluse_1");
        assert_eq!(
            wire["messages"][2]["content"][0],
            json!({"toolResult": {
                "toolUseId": "tooluse_1",
                "content": [{"text": "Result is 9.0"}],
                "status": "success"
            }})
        );
        assert_eq!(wire["system"], json!([{"text": "Be brief."}]));
        assert_eq!(wire["inferenceConfig"]["maxTokens"], 512);
        assert!(wire.get("toolConfig").is_none());
    }

    #[test]
    fn response_parsing() {
        let body = json!({
            "output": {"message": {"role": "assistant", "content": [
                {"reasoningContent": {"reasoningText": {"text": "..."}}},
                {"text": "I'll add them."},
                {"toolUse": {"toolUseId": "tooluse_1", "name": "add_two_numbers", "input": {"a": 4}}}
            ]}},
            "stopReason": "tool_use",
            "usage": {"inputTokens": 12, "outputTokens": 7, "totalTokens": 19}
        });
        let response: ConverseResponse = serde_json::from_value(body).unwrap();
        assert_eq!(StopReason::from_wire(&response.stop_reason), StopReason::ToolUse);
        assert_eq!(response.usage.output_tokens, 7);

        let message = BedrockBackend::response_to_message(response.output.message.content);
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.first_text(), Some("I'll add them."));
        assert_eq!(message.tool_uses()[0].id, "tooluse_1");
    }
}
