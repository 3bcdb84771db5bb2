use thiserror::Error;

/// Domain-level errors for pull API operations
///
/// Infrastructure implementations convert their specific errors to this type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    /// The endpoint exists but does not serve this kind of request
    #[error("Endpoint not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Domain-level errors for durable storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;
