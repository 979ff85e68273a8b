//! Protocol session over a channel pair (handshake, requests, lifecycle).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handlers::{self, Handlers};
use crate::protocol::{
    CallToolParams, CallToolResult, ElicitRequestParams, INVALID_PARAMS, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsParams, ListToolsResult, LoggingLevel, LoggingMessageParams,
    PROTOCOL_VERSION, RequestId, SetLevelParams, Tool, methods,
};
use crate::transport::{ChannelPair, Cleanup, Inbound};

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_TOOL_PAGES: usize = 100;

/// Lifecycle of a [`Session`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Timeouts and negotiation settings for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Deadline for the `initialize` round trip.
    pub init_timeout: Duration,
    /// Deadline for every later request, tool calls included.
    pub request_timeout: Duration,
    /// Deadline for a log callback invocation.
    pub handler_timeout: Duration,
    /// Level requested via `logging/setLevel` when the server supports logging.
    pub log_level: Option<LoggingLevel>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(5),
            log_level: Some(LoggingLevel::Info),
        }
    }
}

type Reply = oneshot::Sender<Result<Value>>;

/// State shared between the session handle and its dispatcher task.
struct Shared {
    state: Mutex<SessionState>,
    /// `None` once the session is closed; new requests are refused.
    pending: Mutex<Option<HashMap<RequestId, Reply>>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `from -> to`; fails if another transition got there first.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Enter `Closed` and drop every pending reply sender, which fails the
    /// waiting callers with `SessionClosed`.
    fn shut(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;
        let dropped = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dropped) = dropped
            && !dropped.is_empty()
        {
            debug!(count = dropped.len(), "failing outstanding requests");
        }
    }

    fn register(&self, id: RequestId, reply: Reply) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let table = pending.as_mut().ok_or(Error::SessionClosed)?;
        table.insert(id, reply);
        Ok(())
    }

    fn take(&self, id: &RequestId) -> Option<Reply> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|table| table.remove(id))
    }

    fn complete(&self, id: &RequestId, outcome: Result<Value>) {
        match self.take(id) {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => debug!(%id, "dropping reply for unknown or abandoned request"),
        }
    }
}

/// Parts held between construction and the handshake.
struct Unstarted {
    incoming: mpsc::Receiver<Inbound>,
    handlers: Handlers,
}

/// A protocol session with one MCP server.
///
/// Obtained from [`Session::open`]. Requests may be issued concurrently from
/// several tasks; [`Session::close`] fails any that are still outstanding.
pub struct Session {
    id: String,
    options: SessionOptions,
    outgoing: mpsc::Sender<JsonRpcMessage>,
    shared: Arc<Shared>,
    next_id: AtomicI64,
    server: OnceLock<InitializeResult>,
    unstarted: Mutex<Option<Unstarted>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl Session {
    /// Bind a session to `pair` and perform the initialization handshake.
    ///
    /// On failure the session is closed and the channel released before the
    /// error is returned.
    pub async fn open(
        pair: ChannelPair,
        handlers: Handlers,
        options: SessionOptions,
    ) -> Result<Self> {
        let session = Self::new(pair, handlers, options);
        session.initialize().await?;
        Ok(session)
    }

    /// Bind a session to `pair` without starting it.
    ///
    /// Nothing is sent until [`Session::initialize`]; until then every
    /// protocol call fails with [`Error::InvalidSessionState`].
    pub fn new(pair: ChannelPair, handlers: Handlers, options: SessionOptions) -> Self {
        let ChannelPair {
            outgoing,
            incoming,
            cleanup,
        } = pair;

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            options,
            outgoing,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Uninitialized),
                pending: Mutex::new(Some(HashMap::new())),
            }),
            next_id: AtomicI64::new(1),
            server: OnceLock::new(),
            unstarted: Mutex::new(Some(Unstarted { incoming, handlers })),
            dispatcher: Mutex::new(None),
            cleanup: Mutex::new(Some(cleanup)),
        }
    }

    /// Run the handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&self) -> Result<()> {
        if !self
            .shared
            .transition(SessionState::Uninitialized, SessionState::Initializing)
        {
            return Err(self.state_error(SessionState::Uninitialized));
        }

        let unstarted = self
            .unstarted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Unstarted { incoming, handlers }) = unstarted {
            let task = tokio::spawn(dispatch(
                incoming,
                self.shared.clone(),
                self.outgoing.clone(),
                handlers,
                self.options.handler_timeout,
            ));
            *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }

        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(session = %self.id, error = %e, "MCP handshake failed");
                self.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<()> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result: InitializeResult = self
            .request(methods::INITIALIZE, Some(params), self.options.init_timeout)
            .await
            .map_err(|e| match e {
                Error::Transport(_) => e,
                Error::JsonRpc(err) => {
                    Error::SessionInit(format!("server rejected initialize: {err}"))
                }
                Error::Timeout { .. } => {
                    Error::SessionInit("timed out waiting for initialize response".into())
                }
                Error::SessionClosed => Error::SessionInit(
                    "server closed the connection during initialization".into(),
                ),
                other => Error::SessionInit(other.to_string()),
            })?;

        if result.protocol_version != PROTOCOL_VERSION {
            warn!(
                requested = PROTOCOL_VERSION,
                negotiated = %result.protocol_version,
                "server negotiated a different protocol version"
            );
        }

        self.outgoing
            .send(JsonRpcNotification::new(methods::INITIALIZED).into())
            .await
            .map_err(|_| {
                Error::SessionInit("channel closed before initialization completed".into())
            })?;

        let supports_logging = result.capabilities.logging.is_some();
        info!(
            session = %self.id,
            server = %result.server_info.name,
            version = ?result.server_info.version,
            "MCP session ready"
        );
        let _ = self.server.set(result);

        if !self
            .shared
            .transition(SessionState::Initializing, SessionState::Ready)
        {
            return Err(Error::SessionInit(
                "server closed the connection during initialization".into(),
            ));
        }

        if let (true, Some(level)) = (supports_logging, self.options.log_level)
            && let Err(e) = self
                .request::<Value>(
                    methods::LOGGING_SET_LEVEL,
                    Some(serde_json::to_value(SetLevelParams { level })?),
                    self.options.request_timeout,
                )
                .await
        {
            debug!(error = %e, "server refused logging/setLevel");
        }

        Ok(())
    }

    /// Unique id of this session, for logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Handshake result, once the session has reached `Ready`.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.get()
    }

    /// List every tool the server offers, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.ensure_ready()?;

        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = serde_json::to_value(ListToolsParams { cursor })?;
            let page: ListToolsResult = self
                .request(methods::TOOLS_LIST, Some(params), self.options.request_timeout)
                .await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!(pages = MAX_TOOL_PAGES, "stopped following tools/list pagination");
        Ok(tools)
    }

    /// Invoke a tool. A tool-level failure comes back as a result with
    /// `is_error` set, not as an `Err`.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.ensure_ready()?;
        debug!(session = %self.id, tool = name, "calling tool");

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        self.request(methods::TOOLS_CALL, Some(params), self.options.request_timeout)
            .await
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<()> {
        self.ensure_ready()?;
        self.request::<Value>(methods::PING, None, self.options.request_timeout)
            .await
            .map(|_| ())
    }

    /// Tear the session down. Never fails; later calls are no-ops.
    ///
    /// Outstanding requests fail with [`Error::SessionClosed`] and the
    /// transport is released exactly once.
    pub async fn close(&self) {
        self.shared.shut();

        if let Some(task) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut cleanup) = cleanup {
            cleanup.release().await;
            debug!(session = %self.id, "MCP session closed");
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(Error::SessionClosed),
            _ => Err(self.state_error(SessionState::Ready)),
        }
    }

    fn state_error(&self, expected: SessionState) -> Error {
        match self.state() {
            SessionState::Closed => Error::SessionClosed,
            actual => Error::InvalidSessionState { expected, actual },
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<R>(&self, method: &str, params: Option<Value>, limit: Duration) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let id = self.next_request_id();
        let (reply, response) = oneshot::channel();
        self.shared.register(id.clone(), reply)?;

        let mut request = JsonRpcRequest::new(id.clone(), method);
        request.params = params;
        if self.outgoing.send(request.into()).await.is_err() {
            self.shared.take(&id);
            return Err(Error::SessionClosed);
        }

        let value = match tokio::time::timeout(limit, response).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(Error::SessionClosed),
            Err(_) => {
                self.shared.take(&id);
                self.notify_cancelled(&id, "request timed out");
                return Err(Error::Timeout {
                    method: method.to_string(),
                });
            }
        };

        serde_json::from_value(value)
            .map_err(|e| Error::InvalidResponse(format!("malformed {method} result: {e}")))
    }

    fn notify_cancelled(&self, id: &RequestId, reason: &str) {
        let notification = JsonRpcNotification::new(methods::CANCELLED)
            .with_params(json!({ "requestId": id, "reason": reason }));
        let _ = self.outgoing.try_send(notification.into());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shut();
        if let Some(task) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("server", &self.server.get().map(|s| &s.server_info.name))
            .finish()
    }
}

/// Inbound loop: resolves pending requests and services server-initiated
/// traffic until the channel ends.
async fn dispatch(
    mut incoming: mpsc::Receiver<Inbound>,
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<JsonRpcMessage>,
    handlers: Handlers,
    handler_timeout: Duration,
) {
    while let Some(inbound) = incoming.recv().await {
        match inbound {
            Inbound::Message(JsonRpcMessage::Response(response)) => {
                let Some(id) = response.id.clone() else {
                    warn!(error = ?response.error, "server sent an unattributed error");
                    continue;
                };
                shared.complete(&id, response.into_result().map_err(Error::JsonRpc));
            }
            Inbound::Message(JsonRpcMessage::Notification(notification)) => {
                handle_notification(notification, &handlers, handler_timeout).await;
            }
            Inbound::Message(JsonRpcMessage::Request(request)) => {
                tokio::spawn(answer_request(request, handlers.clone(), outgoing.clone()));
            }
            Inbound::Failed {
                id: Some(id),
                error,
            } => shared.complete(&id, Err(Error::Transport(error))),
            Inbound::Failed { id: None, error } => {
                warn!(%error, "failed to deliver message to server");
            }
        }
    }

    debug!("MCP channel ended");
    shared.shut();
}

async fn handle_notification(
    notification: JsonRpcNotification,
    handlers: &Handlers,
    handler_timeout: Duration,
) {
    match notification.method.as_str() {
        methods::LOGGING_MESSAGE => {
            let params = notification.params.unwrap_or(Value::Null);
            match serde_json::from_value::<LoggingMessageParams>(params) {
                Ok(params) => handlers::handle_log(handlers, params, handler_timeout).await,
                Err(e) => warn!(error = %e, "malformed log notification"),
            }
        }
        other => debug!(method = other, "ignoring server notification"),
    }
}

async fn answer_request(
    request: JsonRpcRequest,
    handlers: Handlers,
    outgoing: mpsc::Sender<JsonRpcMessage>,
) {
    let JsonRpcRequest {
        id, method, params, ..
    } = request;

    let response = match method.as_str() {
        methods::PING => JsonRpcResponse::success(id, json!({})),
        methods::ELICITATION_CREATE => {
            match serde_json::from_value::<ElicitRequestParams>(params.unwrap_or(Value::Null)) {
                Ok(params) => {
                    debug!(message = %params.message, "server requested user input");
                    JsonRpcResponse::success(id, handlers::answer_elicitation(&handlers, params).await)
                }
                Err(e) => JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(INVALID_PARAMS, format!("invalid elicitation params: {e}")),
                ),
            }
        }
        other => {
            debug!(method = other, "rejecting unsupported server request");
            JsonRpcResponse::failure(id, JsonRpcError::method_not_found(other))
        }
    };

    if outgoing.send(response.into()).await.is_err() {
        debug!("channel closed before answering server request");
    }
}
