//! MCP error types.

use crate::protocol::JsonRpcError;
use crate::session::SessionState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("session initialization failed: {0}")]
    SessionInit(String),

    #[error("invalid session state: expected {expected}, found {actual}")]
    InvalidSessionState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("session closed")]
    SessionClosed,

    #[error("timeout waiting for response to {method}")]
    Timeout { method: String },

    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),
}

pub type Result<T> = std::result::Result<T, Error>;
