//! Purser runtime: the tool-use conversation loop and inference backends.
//!
//! # Overview
//!
//! - **ToolHost**: where tools come from. An [`mcp::Session`] is one.
//! - **Catalog**: projects the host's tools into the model's tool config.
//! - **Backend**: a trait abstracting inference providers (Anthropic
//!   Messages API, Bedrock Converse API).
//! - **Conversation**: runs a query to a final answer, calling tools as the
//!   model asks, over a caller-owned [`Transcript`].
//!
//! # Example
//!
//! ```no_run
//! use runtime::{BedrockBackend, Conversation, Transcript};
//!
//! # async fn example(session: mcp::Session) -> runtime::Result<()> {
//! let backend = BedrockBackend::builder("api-key", "us.anthropic.claude-3-7-sonnet-20250219-v1:0")
//!     .region("us-east-1")
//!     .build();
//! let conversation = Conversation::new(backend).with_system_prompt("You are a calculator.");
//!
//! let mut transcript = Transcript::new();
//! let answer = conversation.run(&session, "What is 4 plus 5?", &mut transcript).await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```

pub mod catalog;
mod conversation;
mod error;
pub mod model;
mod providers;
mod tools;

pub use catalog::{ToolConfig, build_tool_config};
pub use conversation::{Conversation, DEFAULT_MAX_TURNS, Transcript, call_tool_direct};
pub use error::{Error, Result};
pub use model::{Backend, Message, ModelError, StopReason};
pub use providers::{
    AnthropicAuth, AnthropicBackend, AnthropicBackendBuilder, BedrockBackend,
    BedrockBackendBuilder, ProviderBackend,
};
pub use tools::{ToolHost, ToolOutcome};
