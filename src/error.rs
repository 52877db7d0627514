//! Error types for pkgstore

use thiserror::Error;

/// Result type alias for pkgstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pkgstore operations
///
/// Lookups that find nothing return `Ok(None)`; there is no not-found variant.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Version {version_id} already exists for user {user_id}")]
    VersionConflict { user_id: String, version_id: String },

    /// Reading the upload source or writing it to storage failed mid-stream
    #[error("Stream error: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store file: {0}")]
    InvalidFile(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller supplied bad input (as opposed to a store fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidVersion(_) | Error::Stream(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}
