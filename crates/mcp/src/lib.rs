//! MCP (Model Context Protocol) client library.
//!
//! Connects to a tool server over a local subprocess or streamable HTTP,
//! runs the protocol session, and routes server-initiated log messages and
//! elicitation requests to application callbacks.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Handlers, Session, SessionOptions, connect_stdio};
//! use std::collections::HashMap;
//!
//! # async fn example() -> mcp::Result<()> {
//! let pair = connect_stdio("python", &["calculator_server.py".to_string()], &HashMap::new()).await?;
//! let handlers = Handlers::new().with_log(|text| eprintln!("server: {text}"));
//! let session = Session::open(pair, handlers, SessionOptions::default()).await?;
//!
//! for tool in session.list_tools().await? {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let result = session
//!     .call_tool("add_two_numbers", Some(serde_json::json!({"a": 2, "b": 3, "operation": "add"})))
//!     .await?;
//! println!("{:?}", result.first_text());
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod handlers;
mod protocol;
mod session;
mod transport;

pub use error::{Error, Result};
pub use handlers::{ElicitationCallback, Handlers, LogCallback, elicit_result_from_input};
pub use protocol::{
    CallToolParams, CallToolResult, ElicitRequestParams as ElicitationRequest,
    ElicitResult as ElicitationResult, ElicitationAction, InitializeResult, JsonRpcError,
    JsonRpcMessage, LoggingLevel, PROTOCOL_VERSION, RequestId, ServerCapabilities, ServerInfo,
    Tool, ToolContent,
};
pub use session::{Session, SessionOptions, SessionState};
pub use transport::{
    ChannelPair, Cleanup, Inbound, SseDecoder, connect_stdio, connect_streaming_http,
};
