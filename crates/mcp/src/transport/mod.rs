//! Session transports.
//!
//! Every transport is normalized into a [`ChannelPair`]: a sender for
//! outgoing JSON-RPC messages, a receiver of inbound traffic, and a
//! [`Cleanup`] handle that owns whatever must be released when the session
//! ends (a child process, an HTTP session, background I/O tasks).

mod http;
mod stdio;

pub use http::{SseDecoder, connect_streaming_http};
pub use stdio::connect_stdio;

use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{JsonRpcMessage, RequestId};

/// Capacity of the inbound and outbound message queues.
pub const CHANNEL_CAPACITY: usize = 64;

/// Maximum size of a single framed message (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long a child gets to exit after its stdin closes before it is killed.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Inbound traffic delivered by a transport.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded message from the peer.
    Message(JsonRpcMessage),
    /// Delivering an outgoing message failed. `id` is set when the failed
    /// message was a request, so its caller can be woken.
    Failed {
        id: Option<RequestId>,
        error: String,
    },
}

/// Read/write channel pair over a transport, plus its cleanup handle.
pub struct ChannelPair {
    pub outgoing: mpsc::Sender<JsonRpcMessage>,
    pub incoming: mpsc::Receiver<Inbound>,
    pub cleanup: Cleanup,
}

impl ChannelPair {
    /// Frame newline-delimited JSON-RPC over an arbitrary byte-stream pair.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (incoming_tx, incoming) = mpsc::channel(CHANNEL_CAPACITY);

        let failures = incoming_tx.downgrade();
        let reader_task = tokio::spawn(read_lines(reader, incoming_tx));
        let writer_task = tokio::spawn(write_lines(writer, outgoing_rx, failures));

        Self {
            outgoing,
            incoming,
            cleanup: Cleanup::new(vec![reader_task, writer_task], Resource::None),
        }
    }
}

/// Resource held open by a transport beyond its I/O tasks.
pub(crate) enum Resource {
    None,
    Child(Child),
    Http(std::sync::Arc<http::HttpContext>),
}

/// Owns the transport's resources; released exactly once.
///
/// `release` is the orderly path. Dropping an unreleased `Cleanup` still
/// aborts the I/O tasks, and child processes are spawned with
/// `kill_on_drop`, so no exit path leaks a process.
pub struct Cleanup {
    tasks: Vec<JoinHandle<()>>,
    resource: Resource,
    released: bool,
}

impl Cleanup {
    pub(crate) fn new(tasks: Vec<JoinHandle<()>>, resource: Resource) -> Self {
        Self {
            tasks,
            resource,
            released: false,
        }
    }

    pub(crate) fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub(crate) fn attach(&mut self, resource: Resource) {
        self.resource = resource;
    }

    /// Whether `release` has already run.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the transport. Calling this more than once is a no-op.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        for task in self.tasks.drain(..) {
            task.abort();
        }

        match std::mem::replace(&mut self.resource, Resource::None) {
            Resource::None => {}
            Resource::Child(child) => reap_child(child).await,
            Resource::Http(context) => context.terminate().await,
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resource = match self.resource {
            Resource::None => "none",
            Resource::Child(_) => "child",
            Resource::Http(_) => "http",
        };
        f.debug_struct("Cleanup")
            .field("tasks", &self.tasks.len())
            .field("resource", &resource)
            .field("released", &self.released)
            .finish()
    }
}

/// Wait briefly for the child to exit on its own (its stdin is closed by
/// now), then kill it.
async fn reap_child(mut child: Child) {
    match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "server process exited"),
        Ok(Err(e)) => warn!(error = %e, "failed to wait for server process"),
        Err(_) => {
            debug!("server process did not exit, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill server process");
            }
        }
    }
}

/// Decode one framed payload (a message or a batch) and forward it.
///
/// Returns `false` once the receiving side is gone.
pub(crate) async fn forward_payload(payload: &str, incoming: &mpsc::Sender<Inbound>) -> bool {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "discarding undecodable message");
            return true;
        }
    };

    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    for item in items {
        match serde_json::from_value::<JsonRpcMessage>(item) {
            Ok(message) => {
                if incoming.send(Inbound::Message(message)).await.is_err() {
                    return false;
                }
            }
            Err(e) => warn!(error = %e, "discarding malformed JSON-RPC message"),
        }
    }
    true
}

async fn read_lines<R>(reader: R, incoming: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let limit = MAX_MESSAGE_SIZE as u64 + 1;

    loop {
        line.clear();
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!("transport reached EOF");
                break;
            }
            Ok(_) => {
                if line.len() > MAX_MESSAGE_SIZE && !line.ends_with(b"\n") {
                    match discard_line(&mut reader).await {
                        Ok(rest) => warn!(
                            size = line.len() + rest,
                            max = MAX_MESSAGE_SIZE,
                            "discarding oversized message"
                        ),
                        Err(e) => {
                            warn!(error = %e, "transport read failed");
                            break;
                        }
                    }
                    continue;
                }
                let Ok(text) = std::str::from_utf8(&line) else {
                    warn!("discarding message that is not valid UTF-8");
                    continue;
                };
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !forward_payload(trimmed, &incoming).await {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "transport read failed");
                break;
            }
        }
    }
}

/// Skip to the end of the current line without buffering it. Returns the
/// number of bytes skipped.
async fn discard_line<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(skipped);
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(skipped + end + 1);
            }
            None => {
                let len = available.len();
                reader.consume(len);
                skipped += len;
            }
        }
    }
}

async fn write_lines<W>(
    mut writer: W,
    mut outgoing: mpsc::Receiver<JsonRpcMessage>,
    failures: mpsc::WeakSender<Inbound>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!(error = %e, "transport write failed");
            if let Some(incoming) = failures.upgrade() {
                let failed = Inbound::Failed {
                    id: request_id(&message),
                    error: e.to_string(),
                };
                let _ = incoming.send(failed).await;
            }
            break;
        }
    }
}

async fn write_message<W>(writer: &mut W, message: &JsonRpcMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Id of an outgoing request; responses and notifications have no caller
/// waiting on them.
pub(crate) fn request_id(message: &JsonRpcMessage) -> Option<RequestId> {
    match message {
        JsonRpcMessage::Request(r) => Some(r.id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcNotification, JsonRpcRequest};
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_messages_both_ways() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut pair = ChannelPair::from_streams(client_read, client_write);

        let (server_read, mut server_write) = tokio::io::split(server_io);
        let mut server_lines = BufReader::new(server_read).lines();

        pair.outgoing
            .send(JsonRpcRequest::new(1i64, "ping").into())
            .await
            .unwrap();
        let sent = server_lines.next_line().await.unwrap().unwrap();
        assert!(sent.contains("\"method\":\"ping\""));

        server_write
            .write_all(b"\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\nnot json\n")
            .await
            .unwrap();
        let Some(Inbound::Message(message)) = pair.incoming.recv().await else {
            panic!("expected a message");
        };
        assert_eq!(message.id(), Some(&RequestId::Number(1)));

        pair.cleanup.release().await;
    }

    #[tokio::test]
    async fn batches_are_split() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut pair = ChannelPair::from_streams(client_read, client_write);
        let (_server_read, mut server_write) = tokio::io::split(server_io);

        let batch = concat!(
            r#"[{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"a"}},"#,
            r#"{"jsonrpc":"2.0","id":2,"result":{}}]"#,
            "\n"
        );
        server_write.write_all(batch.as_bytes()).await.unwrap();

        let first = pair.incoming.recv().await.unwrap();
        let second = pair.incoming.recv().await.unwrap();
        assert!(matches!(first, Inbound::Message(JsonRpcMessage::Notification(_))));
        assert!(matches!(second, Inbound::Message(JsonRpcMessage::Response(_))));
    }

    #[tokio::test]
    async fn eof_closes_incoming() {
        let (client_io, server_io) = duplex(64);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut pair = ChannelPair::from_streams(client_read, client_write);
        drop(server_io);

        assert!(pair.incoming.recv().await.is_none());
        let _ = pair
            .outgoing
            .send(JsonRpcNotification::new("notifications/initialized").into())
            .await;
    }

    #[tokio::test]
    async fn bad_lines_are_skipped() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut pair = ChannelPair::from_streams(client_read, client_write);
        let (_server_read, mut server_write) = tokio::io::split(server_io);

        let writer = tokio::spawn(async move {
            server_write.write_all(b"\xff\xfe{}\n").await.unwrap();
            let oversized = vec![b'x'; MAX_MESSAGE_SIZE + 10];
            server_write.write_all(&oversized).await.unwrap();
            server_write
                .write_all(b"\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n")
                .await
                .unwrap();
            server_write
        });

        let Some(Inbound::Message(message)) = pair.incoming.recv().await else {
            panic!("expected a message");
        };
        assert_eq!(message.id(), Some(&RequestId::Number(3)));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (client_io, _server_io) = duplex(64);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut pair = ChannelPair::from_streams(client_read, client_write);

        assert!(!pair.cleanup.is_released());
        pair.cleanup.release().await;
        pair.cleanup.release().await;
        assert!(pair.cleanup.is_released());
    }
}
