use crate::model::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Session misuse or failure; the inner error keeps
    /// `InvalidSessionState` and `SessionClosed` distinguishable.
    #[error(transparent)]
    Session(#[from] mcp::Error),

    #[error("failed to build tool catalog: {0}")]
    Catalog(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("unhandled stop reason: {0}")]
    UnhandledStopReason(String),

    #[error("model stopped for tool use but sent no tool-use block")]
    MissingToolUse,

    #[error("model ended its turn without any text")]
    EmptyResponse,

    #[error("no final answer after {0} model turns")]
    MaxTurnsExceeded(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
