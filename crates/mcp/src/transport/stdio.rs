//! Local subprocess transport (newline-delimited JSON over stdin/stdout).

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{ChannelPair, Resource};
use crate::error::{Error, Result};

/// Spawn a server process and bind a channel pair to its stdin/stdout.
///
/// The child's stderr is drained into the `mcp::server` tracing target.
pub async fn connect_stdio(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<ChannelPair> {
    debug!(command, ?args, "spawning MCP server");

    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Transport(format!("failed to spawn {command}: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transport("failed to capture server stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Transport("failed to capture server stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Transport("failed to capture server stderr".into()))?;

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "mcp::server", "{line}");
        }
    });

    let mut pair = ChannelPair::from_streams(stdout, stdin);
    pair.cleanup.track(stderr_task);
    pair.cleanup.attach(Resource::Child(child));
    Ok(pair)
}
