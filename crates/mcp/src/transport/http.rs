//! Streamable HTTP transport.
//!
//! Each outgoing message is POSTed on its own task; the reply is either a
//! single JSON body or an SSE stream that may interleave server requests and
//! notifications before the response. Once the session is initialized a
//! standalone GET stream carries server-initiated traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{CHANNEL_CAPACITY, ChannelPair, Cleanup, Inbound, Resource, request_id};
use crate::error::{Error, Result};
use crate::protocol::{JsonRpcMessage, RequestId, methods};

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const EVENT_STREAM: &str = "text/event-stream";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a streamable HTTP channel to `url`, sending `headers` on every request.
///
/// No request is made until the first message is sent; an unreachable peer
/// surfaces as a failed delivery of that message.
pub async fn connect_streaming_http(
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<ChannelPair> {
    let parsed = Url::parse(url)
        .map_err(|e| Error::Transport(format!("invalid server URL {url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::Transport(format!(
            "unsupported URL scheme for streamable HTTP: {}",
            parsed.scheme()
        )));
    }

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build()
        .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;

    let (outgoing, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (incoming_tx, incoming) = mpsc::channel(CHANNEL_CAPACITY);

    let context = Arc::new(HttpContext {
        client,
        url: parsed,
        headers: build_headers(headers)?,
        session_id: Mutex::new(None),
        protocol_version: Mutex::new(None),
        incoming: incoming_tx,
    });
    debug!(url = %context.url, "opened streamable HTTP channel");

    let dispatcher = tokio::spawn(dispatch_outgoing(context.clone(), outgoing_rx));

    Ok(ChannelPair {
        outgoing,
        incoming,
        cleanup: Cleanup::new(vec![dispatcher], Resource::Http(context)),
    })
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Transport(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Transport(format!("invalid value for header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Shared state of one HTTP session.
pub(crate) struct HttpContext {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    incoming: mpsc::Sender<Inbound>,
}

impl HttpContext {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_headers(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request.headers(self.headers.clone());
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(version) = self.protocol_version() {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        request
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };
        let mut current = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() != Some(session_id) {
            debug!(session_id, "MCP HTTP session established");
            *current = Some(session_id.to_string());
        }
    }

    /// POST one message. For requests, reads the reply until the matching
    /// response has been delivered.
    async fn send(&self, message: &JsonRpcMessage) -> std::result::Result<(), String> {
        let body = serde_json::to_vec(message).map_err(|e| e.to_string())?;
        let request = self
            .apply_headers(self.client.post(self.url.clone()))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(ACCEPT, JSON_AND_SSE_ACCEPT)
            .body(body);

        let response = request
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {e}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {body}"));
        }
        self.capture_session_id(&response);

        let Some(id) = request_id(message) else {
            return Ok(());
        };
        let awaited = Awaited {
            id,
            initialize: message.method() == Some(methods::INITIALIZE),
        };

        let answered = if is_event_stream(&response) {
            self.read_event_stream(response, &awaited).await?
        } else {
            let body = response.bytes().await.map_err(|e| e.to_string())?;
            let text = String::from_utf8_lossy(&body);
            !text.trim().is_empty() && self.deliver(text.trim(), Some(&awaited)).await
        };

        if answered {
            Ok(())
        } else {
            Err("server closed the reply without a response".to_string())
        }
    }

    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        awaited: &Awaited,
    ) -> std::result::Result<bool, String> {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            for data in decoder.push(&chunk) {
                if self.deliver(&data, Some(awaited)).await {
                    return Ok(true);
                }
            }
        }
        for data in decoder.finish() {
            if self.deliver(&data, Some(awaited)).await {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Forward every message in `payload`; returns whether the awaited
    /// response was among them.
    async fn deliver(&self, payload: &str, awaited: Option<&Awaited>) -> bool {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "discarding undecodable MCP HTTP payload");
                return false;
            }
        };
        let items = match value {
            Value::Array(items) => items,
            single => vec![single],
        };

        let mut answered = false;
        for item in items {
            let message = match serde_json::from_value::<JsonRpcMessage>(item) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "discarding malformed JSON-RPC message");
                    continue;
                }
            };
            if let (JsonRpcMessage::Response(response), Some(awaited)) = (&message, awaited) {
                if response.id.as_ref() == Some(&awaited.id) {
                    answered = true;
                    if awaited.initialize {
                        self.capture_protocol_version(response.result.as_ref());
                    }
                }
            }
            if self.incoming.send(Inbound::Message(message)).await.is_err() {
                break;
            }
        }
        answered
    }

    fn capture_protocol_version(&self, result: Option<&Value>) {
        let version = result
            .and_then(|r| r.get("protocolVersion"))
            .and_then(Value::as_str);
        if let Some(version) = version {
            *self
                .protocol_version
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(version.to_string());
        }
    }

    /// Best-effort DELETE of the server-side session.
    pub(crate) async fn terminate(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let request = self.apply_headers(self.client.delete(self.url.clone()));
        match tokio::time::timeout(TERMINATE_TIMEOUT, request.send()).await {
            Ok(Ok(response)) => {
                debug!(session_id, status = %response.status(), "terminated MCP HTTP session")
            }
            Ok(Err(e)) => debug!(session_id, error = %e, "failed to terminate MCP HTTP session"),
            Err(_) => debug!(session_id, "timed out terminating MCP HTTP session"),
        }
    }
}

/// The request whose response a POST is waiting for.
struct Awaited {
    id: RequestId,
    initialize: bool,
}

enum PostOutcome {
    Done,
    StartListener,
}

async fn dispatch_outgoing(
    context: Arc<HttpContext>,
    mut outgoing: mpsc::Receiver<JsonRpcMessage>,
) {
    // Dropping the set aborts in-flight posts and the listener.
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else { break };
                // Requests run concurrently; notifications and responses go
                // out in order.
                if matches!(message, JsonRpcMessage::Request(_)) {
                    tasks.spawn(post(context.clone(), message));
                } else if let PostOutcome::StartListener = post(context.clone(), message).await {
                    tasks.spawn(listen(context.clone()));
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(PostOutcome::StartListener) = joined {
                    tasks.spawn(listen(context.clone()));
                }
            }
        }
    }
}

async fn post(context: Arc<HttpContext>, message: JsonRpcMessage) -> PostOutcome {
    let id = request_id(&message);
    let method = message.method().map(str::to_string);

    match context.send(&message).await {
        Ok(()) if method.as_deref() == Some(methods::INITIALIZED) => PostOutcome::StartListener,
        Ok(()) => PostOutcome::Done,
        Err(error) => {
            warn!(?method, %error, "MCP HTTP post failed");
            let _ = context.incoming.send(Inbound::Failed { id, error }).await;
            PostOutcome::Done
        }
    }
}

/// Standalone GET stream for server-initiated requests and notifications.
async fn listen(context: Arc<HttpContext>) -> PostOutcome {
    let request = context
        .apply_headers(context.client.get(context.url.clone()))
        .header(ACCEPT, EVENT_STREAM);

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "MCP HTTP event stream unavailable");
            return PostOutcome::Done;
        }
    };
    if response.status() == StatusCode::METHOD_NOT_ALLOWED {
        debug!("server does not offer a standalone event stream");
        return PostOutcome::Done;
    }
    if !response.status().is_success() || !is_event_stream(&response) {
        debug!(status = %response.status(), "ignoring non event-stream GET reply");
        return PostOutcome::Done;
    }

    debug!("listening for server-initiated messages");
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        for data in decoder.push(&chunk) {
            context.deliver(&data, None).await;
        }
    }
    for data in decoder.finish() {
        context.deliver(&data, None).await;
    }
    debug!("server event stream ended");
    PostOutcome::Done
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(EVENT_STREAM))
}

/// Incremental server-sent-events decoder.
///
/// Yields the (newline-joined) `data` of each completed event. Comments and
/// `event`/`id`/`retry` fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk and return the payloads of the events it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = String::from_utf8_lossy(&raw);
            self.process_line(&line, &mut events);
        }
        events
    }

    /// Flush whatever the stream ended with.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            let line = String::from_utf8_lossy(&rest);
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            self.dispatch(events);
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }

    fn dispatch(&mut self, events: &mut Vec<String>) {
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
    }
}
