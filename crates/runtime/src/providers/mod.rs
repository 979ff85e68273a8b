//! LLM provider adapters.
//!
//! Each provider implements the backend trait for its specific API.

mod anthropic;
mod bedrock;

pub use anthropic::{AnthropicAuth, AnthropicBackend, AnthropicBackendBuilder};
pub use bedrock::{BedrockBackend, BedrockBackendBuilder};

use crate::model::{Backend, ModelError, ModelRequest, ModelResponse};

/// A backend chosen at runtime from configuration.
pub enum ProviderBackend {
    Anthropic(AnthropicBackend),
    Bedrock(BedrockBackend),
}

impl std::fmt::Display for ProviderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic(backend) => std::fmt::Display::fmt(backend, f),
            Self::Bedrock(backend) => std::fmt::Display::fmt(backend, f),
        }
    }
}

impl Backend for ProviderBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        match self {
            Self::Anthropic(backend) => backend.call(request).await,
            Self::Bedrock(backend) => backend.call(request).await,
        }
    }
}

impl From<AnthropicBackend> for ProviderBackend {
    fn from(backend: AnthropicBackend) -> Self {
        Self::Anthropic(backend)
    }
}

impl From<BedrockBackend> for ProviderBackend {
    fn from(backend: BedrockBackend) -> Self {
        Self::Bedrock(backend)
    }
}
