use thiserror::Error;

/// Errors from inference API calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// The request never got a reply (connect, TLS, timeout).
    #[error("network: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("provider api: {0}")]
    Api(String),

    /// The provider reply could not be decoded.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}
