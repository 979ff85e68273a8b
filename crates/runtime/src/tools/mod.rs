//! Tool execution boundary and result interpretation.

mod host;
mod outcome;

pub use host::ToolHost;
pub use outcome::ToolOutcome;
