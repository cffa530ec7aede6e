//! Error types for Quiver.

use thiserror::Error;

/// Result type alias for Quiver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Quiver.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The meta store or broker rejected the operation and a retry may help
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// An RPC or internal wait exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A peer session disappeared while work was outstanding
    #[error("Peer lost: {0}")]
    LostPeer(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The entity already exists; callers should reuse the existing one
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// CAS budget exhausted, decode failure, or other unexpected condition
    #[error("Unexpected error: {0}")]
    Unexpected(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether retrying the same operation within a bounded budget may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
