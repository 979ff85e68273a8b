//! Callbacks for server-initiated events (log messages, elicitation).

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ElicitRequestParams, ElicitResult, ElicitationAction, LoggingLevel, LoggingMessageParams,
};

/// Sink for server log payloads.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Answers an elicitation prompt: `(message, requested_schema) -> user input`.
pub type ElicitationCallback = Arc<dyn Fn(&str, &Value) -> String + Send + Sync>;

/// Callbacks registered on a session at open time.
#[derive(Clone, Default)]
pub struct Handlers {
    pub log: Option<LogCallback>,
    pub elicitation: Option<ElicitationCallback>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log = Some(Arc::new(callback));
        self
    }

    pub fn with_elicitation(
        mut self,
        callback: impl Fn(&str, &Value) -> String + Send + Sync + 'static,
    ) -> Self {
        self.elicitation = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("log", &self.log.is_some())
            .field("elicitation", &self.elicitation.is_some())
            .finish()
    }
}

/// Trace a server log message, then hand it to the log callback.
///
/// The callback runs on the blocking pool; a panic or overrun is logged and
/// swallowed.
pub(crate) async fn handle_log(handlers: &Handlers, params: LoggingMessageParams, limit: Duration) {
    let text = params.text();
    let logger = params.logger.as_deref().unwrap_or("server");
    match params.level {
        LoggingLevel::Debug => debug!(target: "mcp::server_log", logger, "Server Log: {text}"),
        LoggingLevel::Info | LoggingLevel::Notice => {
            info!(target: "mcp::server_log", logger, "Server Log: {text}")
        }
        LoggingLevel::Warning => warn!(target: "mcp::server_log", logger, "Server Log: {text}"),
        _ => error!(target: "mcp::server_log", logger, "Server Log: {text}"),
    }

    let Some(callback) = handlers.log.clone() else {
        return;
    };
    let task = tokio::task::spawn_blocking(move || callback(&text));
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "log callback failed"),
        Err(_) => warn!(timeout = ?limit, "log callback timed out"),
    }
}

/// Obtain the user's answer to an elicitation request.
///
/// Falls back to a terminal prompt when no callback is registered. A
/// panicking callback answers `cancel`.
pub(crate) async fn answer_elicitation(
    handlers: &Handlers,
    params: ElicitRequestParams,
) -> ElicitResult {
    let callback: ElicitationCallback = match &handlers.elicitation {
        Some(callback) => callback.clone(),
        None => Arc::new(prompt_terminal),
    };
    let ElicitRequestParams {
        message,
        requested_schema,
    } = params;

    match tokio::task::spawn_blocking(move || callback(&message, &requested_schema)).await {
        Ok(input) => elicit_result_from_input(&input),
        Err(e) => {
            warn!(error = %e, "elicitation callback failed, cancelling");
            ElicitResult {
                action: ElicitationAction::Cancel,
                content: None,
            }
        }
    }
}

/// Map free-form user input to an elicitation result.
///
/// `y`, `yes` and `proceed` (any case) accept; everything else declines.
pub fn elicit_result_from_input(input: &str) -> ElicitResult {
    let answer = input.trim().to_lowercase();
    let action = if matches!(answer.as_str(), "y" | "yes" | "proceed") {
        ElicitationAction::Accept
    } else {
        ElicitationAction::Decline
    };
    ElicitResult {
        action,
        content: Some(json!({ "userResponse": input })),
    }
}

fn prompt_terminal(message: &str, _schema: &Value) -> String {
    prompt(message, &mut io::stdin().lock(), &mut io::stdout().lock())
}

/// Write `message` to `output` and read one line of `input`, without its
/// line ending. EOF or a read error yields an empty answer.
fn prompt(message: &str, input: &mut impl BufRead, output: &mut impl Write) -> String {
    let _ = write!(output, "{message} ");
    let _ = output.flush();

    let mut line = String::new();
    if let Err(e) = input.read_line(&mut line) {
        warn!(error = %e, "failed to read elicitation answer");
    }
    line.trim_end_matches(['\r', '\n']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn log_params(data: Value) -> LoggingMessageParams {
        serde_json::from_value(json!({ "level": "info", "data": data })).unwrap()
    }

    #[test]
    fn input_mapping() {
        for input in ["y", "Yes", " PROCEED "] {
            assert_eq!(
                elicit_result_from_input(input).action,
                ElicitationAction::Accept
            );
        }
        for input in ["n", "", "maybe"] {
            assert_eq!(
                elicit_result_from_input(input).action,
                ElicitationAction::Decline
            );
        }
        let result = elicit_result_from_input("y");
        assert_eq!(result.content, Some(json!({ "userResponse": "y" })));
    }

    #[test]
    fn terminal_prompt_reads_one_line() {
        let mut input = io::Cursor::new("yes\r\nsecond line\n");
        let mut output = Vec::new();
        let answer = prompt("Proceed with division?", &mut input, &mut output);

        assert_eq!(answer, "yes");
        assert_eq!(String::from_utf8(output).unwrap(), "Proceed with division? ");
        assert_eq!(
            elicit_result_from_input(&answer).action,
            ElicitationAction::Accept
        );
    }

    #[test]
    fn terminal_prompt_at_eof_declines() {
        let mut input = io::Cursor::new("");
        let answer = prompt("Continue?", &mut input, &mut io::sink());
        assert_eq!(answer, "");
        assert_eq!(
            elicit_result_from_input(&answer).action,
            ElicitationAction::Decline
        );
    }

    #[tokio::test]
    async fn log_callback_receives_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handlers = Handlers::new().with_log(move |text| sink.lock().unwrap().push(text.to_string()));

        handle_log(&handlers, log_params(json!("adding 2 and 3")), Duration::from_secs(1)).await;
        handle_log(&handlers, log_params(json!({"step": 2})), Duration::from_secs(1)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["adding 2 and 3", r#"{"step":2}"#]);
    }

    #[tokio::test]
    async fn panicking_log_callback_is_contained() {
        let handlers = Handlers::new().with_log(|_| panic!("sink exploded"));
        handle_log(&handlers, log_params(json!("x")), Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn elicitation_callback_gets_message_and_schema() {
        let handlers = Handlers::new().with_elicitation(|message, schema| {
            assert_eq!(message, "Proceed with division?");
            assert_eq!(schema["type"], "object");
            "proceed".to_string()
        });
        let params = ElicitRequestParams {
            message: "Proceed with division?".to_string(),
            requested_schema: json!({ "type": "object" }),
        };
        let result = answer_elicitation(&handlers, params).await;
        assert_eq!(result.action, ElicitationAction::Accept);
    }

    #[tokio::test]
    async fn panicking_elicitation_cancels() {
        let handlers = Handlers::new().with_elicitation(|_, _| panic!("no terminal"));
        let params = ElicitRequestParams {
            message: "?".to_string(),
            requested_schema: Value::Null,
        };
        let result = answer_elicitation(&handlers, params).await;
        assert_eq!(result.action, ElicitationAction::Cancel);
        assert!(result.content.is_none());
    }
}
