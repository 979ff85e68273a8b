//! The tool-use conversation loop.
//!
//! A run appends the user's query, then alternates model calls and tool
//! calls until the model ends its turn. Every assistant turn that requests a
//! tool is immediately followed by one user turn answering it.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::build_tool_config;
use crate::error::{Error, Result};
use crate::model::{Backend, Message, ModelRequest, StopReason, ToolResult};
use crate::tools::{ToolHost, ToolOutcome};

/// Model calls allowed in one run before giving up.
pub const DEFAULT_MAX_TURNS: usize = 25;

/// Ordered message history, owned by the caller across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }
}

/// Drives a backend through tool-use round trips.
pub struct Conversation<B> {
    backend: B,
    system_prompt: Option<String>,
    max_turns: usize,
}

impl<B: Backend> Conversation<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            system_prompt: None,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// At least one model call is always allowed.
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Answer `query`, calling tools on `host` as the model asks.
    ///
    /// Returns the first text block of the final assistant turn. On error the
    /// transcript is restored to its length before the call.
    pub async fn run<H: ToolHost>(
        &self,
        host: &H,
        query: &str,
        transcript: &mut Transcript,
    ) -> Result<String> {
        let checkpoint = transcript.len();
        let result = self.drive(host, query, transcript).await;
        if let Err(e) = &result {
            warn!(error = %e, "conversation run failed, discarding its messages");
            transcript.truncate(checkpoint);
        }
        result
    }

    async fn drive<H: ToolHost>(
        &self,
        host: &H,
        query: &str,
        transcript: &mut Transcript,
    ) -> Result<String> {
        transcript.push(Message::user(query));
        let tool_config = build_tool_config(host).await?;

        for turn in 1..=self.max_turns {
            let response = self
                .backend
                .call(ModelRequest {
                    messages: transcript.messages(),
                    system: self.system_prompt.as_deref(),
                    tool_config: &tool_config,
                })
                .await?;
            debug!(
                turn,
                stop_reason = %response.stop_reason,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "model turn complete"
            );

            let message = response.message;
            match response.stop_reason {
                StopReason::ToolUse => {
                    let results = answer_tool_uses(host, &message).await?;
                    transcript.push(message);
                    transcript.push(Message::tool_results(results));
                }
                StopReason::EndTurn => {
                    let text = message.first_text().map(str::to_string);
                    transcript.push(message);
                    return text.ok_or(Error::EmptyResponse);
                }
                StopReason::Other(raw) => return Err(Error::UnhandledStopReason(raw)),
            }
        }

        Err(Error::MaxTurnsExceeded(self.max_turns))
    }
}

/// Run the first requested tool; any further requests in the same turn are
/// answered with an error result without running them.
async fn answer_tool_uses<H: ToolHost>(host: &H, message: &Message) -> Result<Vec<ToolResult>> {
    let uses = message.tool_uses();
    let Some((first, rest)) = uses.split_first() else {
        return Err(Error::MissingToolUse);
    };

    info!(tool = %first.name, input = %first.input, "LLM requested tool use");
    let outcome = invoke(host, &first.name, first.input.clone()).await?;
    if let ToolOutcome::Failure(reason) = &outcome {
        warn!(tool = %first.name, %reason, "tool call failed");
    }

    let mut results = vec![outcome.into_tool_result(&first.id)];
    for skipped in rest {
        warn!(tool = %skipped.name, "ignoring additional tool request in the same turn");
        results.push(ToolResult::error(
            &skipped.id,
            "not executed: only one tool call is run per turn",
        ));
    }
    Ok(results)
}

/// Call a tool without involving the model.
pub async fn call_tool_direct<H: ToolHost>(
    host: &H,
    name: &str,
    arguments: Value,
) -> Result<ToolOutcome> {
    info!(tool = name, input = %arguments, "invoking server tool");
    let outcome = invoke(host, name, arguments).await?;
    if let ToolOutcome::Failure(reason) = &outcome {
        warn!(tool = name, %reason, "tool run status is not successful");
    }
    Ok(outcome)
}

/// Protocol-level rejections of a call are the model's problem; transport
/// and session failures end the run.
async fn invoke<H: ToolHost>(host: &H, name: &str, input: Value) -> Result<ToolOutcome> {
    match host.call_tool(name, input).await {
        Ok(result) => Ok(ToolOutcome::from_call_result(&result)),
        Err(mcp::Error::JsonRpc(e)) => Ok(ToolOutcome::Failure(e.message)),
        Err(mcp::Error::InvalidResponse(e)) => Ok(ToolOutcome::Failure(e)),
        Err(e) => Err(Error::Session(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolConfig;
    use crate::model::{ModelError, ModelResponse, Part, Role, ToolStatus, ToolUse, Usage};
    use mcp::{CallToolResult, Tool};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct SeenRequest {
        messages: usize,
        system: Option<String>,
        tool_config: ToolConfig,
    }

    /// Replays canned responses; `fallback` repeats once the script is spent.
    #[derive(Default)]
    struct ScriptedBackend {
        script: Mutex<VecDeque<ModelResponse>>,
        fallback: Option<ModelResponse>,
        seen: Mutex<Vec<SeenRequest>>,
    }

    impl ScriptedBackend {
        fn new(script: impl IntoIterator<Item = ModelResponse>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Default::default()
            }
        }

        fn repeating(response: ModelResponse) -> Self {
            Self {
                fallback: Some(response),
                ..Default::default()
            }
        }
    }

    impl Backend for ScriptedBackend {
        async fn call(
            &self,
            request: ModelRequest<'_>,
        ) -> std::result::Result<ModelResponse, ModelError> {
            self.seen.lock().unwrap().push(SeenRequest {
                messages: request.messages.len(),
                system: request.system.map(str::to_string),
                tool_config: request.tool_config.clone(),
            });
            let next = self.script.lock().unwrap().pop_front();
            next.or_else(|| self.fallback.clone())
                .ok_or_else(|| ModelError::Api("script exhausted".into()))
        }
    }

    struct FakeHost {
        tools: Vec<Tool>,
        replies: Mutex<VecDeque<mcp::Result<CallToolResult>>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeHost {
        fn new(replies: impl IntoIterator<Item = mcp::Result<CallToolResult>>) -> Self {
            Self {
                tools: vec![Tool {
                    name: "add_two_numbers".into(),
                    title: None,
                    description: Some("Tool to add two numbers".into()),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "a": {"type": "number", "title": "A"},
                            "b": {"type": "number", "title": "B"},
                            "operation": {"type": "string", "title": "Operation"}
                        }
                    }),
                }],
                replies: Mutex::new(replies.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolHost for FakeHost {
        async fn list_tools(&self) -> mcp::Result<Vec<Tool>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, input: Value) -> mcp::Result<CallToolResult> {
            self.calls.lock().unwrap().push((name.to_string(), input));
            let reply = self.replies.lock().unwrap().pop_front();
            reply.unwrap_or_else(|| Ok(payload(r#"{"tool_run_status":"success","result":0}"#)))
        }
    }

    fn payload(text: &str) -> CallToolResult {
        serde_json::from_value(json!({"content": [{"type": "text", "text": text}]})).unwrap()
    }

    fn tool_use(id: &str, input: Value) -> Part {
        Part::ToolUse(ToolUse {
            id: id.into(),
            name: "add_two_numbers".into(),
            input,
        })
    }

    fn wants_tools(parts: Vec<Part>) -> ModelResponse {
        ModelResponse {
            stop_reason: StopReason::ToolUse,
            message: Message {
                role: Role::Assistant,
                parts,
            },
            usage: Usage::default(),
        }
    }

    fn answers(text: &str) -> ModelResponse {
        ModelResponse {
            stop_reason: StopReason::EndTurn,
            message: Message::assistant(text),
            usage: Usage::default(),
        }
    }

    fn tool_result_of(message: &Message) -> &ToolResult {
        match &message.parts[0] {
            Part::ToolResult(result) => result,
            other => panic!("expected a tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn calculator_scenario() {
        let backend = ScriptedBackend::new([
            wants_tools(vec![
                Part::Text("Let me add those.".into()),
                tool_use("tu-1", json!({"a": 4, "b": 5, "operation": "add"})),
            ]),
            answers("The sum of 4 and 5 is 9"),
        ]);
        let host = FakeHost::new([Ok(payload(r#"{"tool_run_status":"success","result":9.0}"#))]);
        let conversation = Conversation::new(backend).with_system_prompt("You are a calculator.");
        let mut transcript = Transcript::new();

        let answer = conversation
            .run(&host, "What is 4 plus 5?", &mut transcript)
            .await
            .unwrap();
        assert_eq!(answer, "The sum of 4 and 5 is 9");

        assert_eq!(
            host.calls(),
            vec![(
                "add_two_numbers".to_string(),
                json!({"a": 4, "b": 5, "operation": "add"})
            )]
        );

        let messages = transcript.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::user("What is 4 plus 5?"));
        assert_eq!(messages[1].tool_uses()[0].id, "tu-1");
        assert_eq!(messages[2].role, Role::User);
        let result = tool_result_of(&messages[2]);
        assert_eq!(result.tool_use_id, "tu-1");
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.content, "Result is 9.0");
        assert_eq!(messages[3].first_text(), Some("The sum of 4 and 5 is 9"));

        let seen = conversation.backend().seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].messages, 1);
        assert_eq!(seen[1].messages, 3);
        assert_eq!(seen[0].system.as_deref(), Some("You are a calculator."));
        assert_eq!(seen[0].tool_config.tools.len(), 1);
    }

    #[tokio::test]
    async fn failed_tool_run_is_reported_to_the_model() {
        let backend = ScriptedBackend::new([
            wants_tools(vec![tool_use("tu-1", json!({"a": 1, "b": 0, "operation": "divide"}))]),
            answers("Division by zero is not allowed."),
        ]);
        let host = FakeHost::new([Ok(payload(
            r#"{"tool_run_status":"failure","result":"division by zero"}"#,
        ))]);
        let conversation = Conversation::new(backend);
        let mut transcript = Transcript::new();

        let answer = conversation.run(&host, "1/0?", &mut transcript).await.unwrap();
        assert_eq!(answer, "Division by zero is not allowed.");

        let result = tool_result_of(&transcript.messages()[2]);
        assert_eq!(result.status, ToolStatus::Error);
        assert!(result.content.contains("division by zero"));
    }

    #[tokio::test]
    async fn protocol_rejection_is_recoverable() {
        let backend = ScriptedBackend::new([
            wants_tools(vec![tool_use("tu-1", json!({}))]),
            answers("That tool is unavailable."),
        ]);
        let host = FakeHost::new([Err(mcp::Error::JsonRpc(mcp::JsonRpcError::new(
            -32602,
            "unknown tool",
        )))]);
        let mut transcript = Transcript::new();

        let answer = Conversation::new(backend)
            .run(&host, "add", &mut transcript)
            .await
            .unwrap();
        assert_eq!(answer, "That tool is unavailable.");
        let result = tool_result_of(&transcript.messages()[2]);
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.content, "unknown tool");
    }

    #[tokio::test]
    async fn only_first_tool_use_runs() {
        let backend = ScriptedBackend::new([
            wants_tools(vec![
                tool_use("tu-1", json!({"a": 1, "b": 2, "operation": "add"})),
                tool_use("tu-2", json!({"a": 3, "b": 4, "operation": "add"})),
            ]),
            answers("3"),
        ]);
        let host = FakeHost::new([]);
        let mut transcript = Transcript::new();

        Conversation::new(backend)
            .run(&host, "two sums", &mut transcript)
            .await
            .unwrap();

        assert_eq!(host.calls().len(), 1);
        let results = &transcript.messages()[2].parts;
        assert_eq!(results.len(), 2);
        assert_eq!(tool_result_of(&transcript.messages()[2]).tool_use_id, "tu-1");
        let Part::ToolResult(skipped) = &results[1] else {
            panic!("expected a second tool result");
        };
        assert_eq!(skipped.tool_use_id, "tu-2");
        assert_eq!(skipped.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn failed_run_rolls_back_transcript() {
        let backend = ScriptedBackend::new([
            wants_tools(vec![tool_use("tu-1", json!({}))]),
            ModelResponse {
                stop_reason: StopReason::Other("max_tokens".into()),
                message: Message::assistant("truncat"),
                usage: Usage::default(),
            },
        ]);
        let host = FakeHost::new([]);
        let mut transcript = Transcript::new();
        transcript.push(Message::user("earlier"));
        transcript.push(Message::assistant("earlier answer"));
        let before = transcript.clone();

        let err = Conversation::new(backend)
            .run(&host, "long question", &mut transcript)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledStopReason(ref raw) if raw == "max_tokens"));
        assert_eq!(transcript, before);
    }

    #[tokio::test]
    async fn tool_use_without_block_is_an_error() {
        let backend = ScriptedBackend::new([wants_tools(vec![Part::Text("hmm".into())])]);
        let host = FakeHost::new([]);
        let mut transcript = Transcript::new();

        let err = Conversation::new(backend)
            .run(&host, "q", &mut transcript)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingToolUse));
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn end_turn_without_text_is_an_error() {
        let backend = ScriptedBackend::new([ModelResponse {
            stop_reason: StopReason::EndTurn,
            message: Message {
                role: Role::Assistant,
                parts: Vec::new(),
            },
            usage: Usage::default(),
        }]);
        let host = FakeHost::new([]);
        let mut transcript = Transcript::new();

        let err = Conversation::new(backend)
            .run(&host, "q", &mut transcript)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyResponse));
    }

    #[tokio::test]
    async fn max_turns_guard() {
        let backend =
            ScriptedBackend::repeating(wants_tools(vec![tool_use("loop", json!({"a": 1}))]));
        let host = FakeHost::new([]);
        let mut transcript = Transcript::new();

        let err = Conversation::new(backend)
            .with_max_turns(3)
            .run(&host, "loop forever", &mut transcript)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MaxTurnsExceeded(3)));
        assert_eq!(host.calls().len(), 3);
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn closed_session_ends_the_run() {
        let backend = ScriptedBackend::new([wants_tools(vec![tool_use("tu-1", json!({}))])]);
        let host = FakeHost::new([Err(mcp::Error::SessionClosed)]);
        let mut transcript = Transcript::new();

        let err = Conversation::new(backend)
            .run(&host, "q", &mut transcript)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Session(mcp::Error::SessionClosed)));
    }

    #[tokio::test]
    async fn transcript_carries_across_runs() {
        let backend = ScriptedBackend::new([answers("Hello"), answers("Still here")]);
        let host = FakeHost::new([]);
        let conversation = Conversation::new(backend);
        let mut transcript = Transcript::new();

        conversation.run(&host, "hi", &mut transcript).await.unwrap();
        conversation.run(&host, "again", &mut transcript).await.unwrap();

        assert_eq!(transcript.len(), 4);
        assert_eq!(conversation.backend().seen.lock().unwrap()[1].messages, 3);
    }

    #[tokio::test]
    async fn direct_tool_call() {
        let host = FakeHost::new([Ok(payload(r#"{"tool_run_status":"success","result":7}"#))]);
        let outcome = call_tool_direct(&host, "add_two_numbers", json!({"a": 3, "b": 4}))
            .await
            .unwrap();
        assert_eq!(outcome, ToolOutcome::Success(json!(7)));
    }
}
