//! Configuration loading from purser.toml.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcp::{LoggingLevel, SessionOptions};
use runtime::{AnthropicAuth, AnthropicBackend, BedrockBackend, DEFAULT_MAX_TURNS, ProviderBackend};
use serde::Deserialize;

use crate::error::Error;

pub const CONFIG_FILE: &str = "purser.toml";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools when \
they help answer the question, and answer concisely.";
const DEFAULT_BEDROCK_MODEL: &str = "us.anthropic.claude-3-7-sonnet-20250219-v1:0";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

pub const ANTHROPIC_KEY_VAR: &str = "ANTHROPIC_API_KEY";
pub const BEDROCK_KEY_VAR: &str = "AWS_BEARER_TOKEN_BEDROCK";
pub const MODEL_VAR: &str = "PURSER_MODEL";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub server: ServerConfig,
    pub chat: ChatConfig,
    pub logging: LoggingConfig,
}

/// Inference provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Bedrock,
    Anthropic,
}

/// Backend provider configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub provider: Provider,

    /// Model id; falls back to `PURSER_MODEL`, then a provider default.
    pub model: Option<String>,

    /// AWS region (Bedrock only).
    pub region: String,

    /// API key; falls back to the provider's environment variable.
    pub api_key: Option<String>,

    /// Anthropic OAuth access token. Mutually exclusive with api_key.
    pub oauth_token: Option<String>,

    pub max_tokens: u32,

    /// Override the provider endpoint.
    pub endpoint: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: None,
            region: "us-east-1".to_string(),
            api_key: None,
            oauth_token: None,
            max_tokens: 4096,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
}

/// Tool server connection.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Inferred from `url`/`command` when omitted.
    pub transport: Option<TransportKind>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Where and how to reach the tool server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEndpoint {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio { command, args, .. } if args.is_empty() => write!(f, "{command}"),
            Self::Stdio { command, args, .. } => write!(f, "{command} {}", args.join(" ")),
            Self::Http { url, .. } => write!(f, "{url}"),
        }
    }
}

impl ServerConfig {
    pub fn endpoint(&self) -> Result<ServerEndpoint, ConfigError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None if self.url.is_some() => TransportKind::StreamableHttp,
            None if self.command.is_some() => TransportKind::Stdio,
            None => return Err(ConfigError::MissingServer),
        };

        match transport {
            TransportKind::Stdio => {
                let command = self.command.clone().ok_or_else(|| {
                    ConfigError::Invalid("stdio transport requires server.command".into())
                })?;
                Ok(ServerEndpoint::Stdio {
                    command,
                    args: self.args.clone(),
                    env: self.env.clone(),
                })
            }
            TransportKind::StreamableHttp => {
                let url = self.url.clone().ok_or_else(|| {
                    ConfigError::Invalid("streamable-http transport requires server.url".into())
                })?;
                Ok(ServerEndpoint::Http {
                    url,
                    headers: self.headers.clone(),
                })
            }
        }
    }
}

/// Conversation settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: String,
    pub max_turns: usize,
    pub init_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            init_timeout_secs: 15,
            request_timeout_secs: 60,
        }
    }
}

impl ChatConfig {
    pub fn session_options(&self, verbose: bool) -> SessionOptions {
        SessionOptions {
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            log_level: Some(if verbose {
                LoggingLevel::Debug
            } else {
                LoggingLevel::Info
            }),
            ..SessionOptions::default()
        }
    }
}

/// Log file settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive for the log file; `RUST_LOG` takes precedence.
    pub level: String,
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: PathBuf::from("./purser.log"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if given; otherwise `purser.toml` when it exists, else
    /// defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(CONFIG_FILE).exists() => Self::load(CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the configured inference backend.
    ///
    /// `env` looks up environment variables.
    pub fn build_backend(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ProviderBackend, Error> {
        let backend = &self.backend;
        let model = backend
            .model
            .clone()
            .or_else(|| env(MODEL_VAR))
            .unwrap_or_else(|| {
                match backend.provider {
                    Provider::Bedrock => DEFAULT_BEDROCK_MODEL,
                    Provider::Anthropic => DEFAULT_ANTHROPIC_MODEL,
                }
                .to_string()
            });

        match backend.provider {
            Provider::Bedrock => {
                let api_key = backend
                    .api_key
                    .clone()
                    .or_else(|| env(BEDROCK_KEY_VAR))
                    .ok_or(Error::MissingApiKey {
                        var: BEDROCK_KEY_VAR,
                    })?;
                let mut builder = BedrockBackend::builder(api_key, model)
                    .region(&backend.region)
                    .max_tokens(backend.max_tokens);
                if let Some(endpoint) = &backend.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                Ok(builder.build().into())
            }
            Provider::Anthropic => {
                let auth = match (&backend.api_key, &backend.oauth_token) {
                    (Some(_), Some(_)) => return Err(ConfigError::AmbiguousAuth.into()),
                    (Some(key), None) => AnthropicAuth::ApiKey(key.clone()),
                    (None, Some(token)) => AnthropicAuth::Oauth(token.clone()),
                    (None, None) => AnthropicAuth::ApiKey(env(ANTHROPIC_KEY_VAR).ok_or(
                        Error::MissingApiKey {
                            var: ANTHROPIC_KEY_VAR,
                        },
                    )?),
                };
                let mut builder =
                    AnthropicBackend::builder(auth, model).max_tokens(backend.max_tokens);
                if let Some(endpoint) = &backend.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                Ok(builder.build().into())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("no MCP server configured: pass --stdio or --url, or set [server] in purser.toml")]
    MissingServer,

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("ambiguous authentication: set either backend.api_key OR backend.oauth_token, not both")]
    AmbiguousAuth,
}
