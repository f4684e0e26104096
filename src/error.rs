//! Gallerybot error types

use thiserror::Error;

/// Gallerybot error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Blob write or remove failed; the artifact set was left unchanged
    #[error("Storage IO error: {0}")]
    StorageIo(String),

    /// Selector or lookup matched nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A pending eviction is already open for this identity
    #[error("An eviction confirmation is already in progress for user {0}")]
    ConflictInProgress(u64),

    /// Pending eviction token outlived its expiry
    #[error("Eviction token expired: {0}")]
    TokenExpired(String),

    /// Pending eviction token was never issued or is already resolved
    #[error("Unknown eviction token: {0}")]
    TokenUnknown(String),

    /// Artifact name failed validation
    #[error("Invalid artifact name: {0}")]
    InvalidName(String),

    /// Artifact name already exists in the identity's gallery
    #[error("Artifact name already in use: {0}")]
    DuplicateName(String),

    /// Audit trail unreachable after bounded retries
    #[error("Audit log query timed out after {attempts} attempts")]
    AuditQueryTimeout { attempts: u32 },

    /// Player has not joined yet
    #[error("User {0} is not registered")]
    NotRegistered(u64),

    /// Channel (Discord transport) error
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Gallerybot operations
pub type Result<T> = std::result::Result<T, Error>;
