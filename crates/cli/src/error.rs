//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid or missing required fields.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No credential for the configured provider.
    #[error("missing API key: set {var} or backend.api_key in purser.toml")]
    MissingApiKey { var: &'static str },

    /// `call --args` was not a JSON object.
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// A direct tool call did not report success.
    #[error("tool {tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// An error occurred in the runtime layer.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    /// An error occurred talking to the MCP server.
    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
