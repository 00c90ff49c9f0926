//! Error types for the Nerita library.
//!
//! All fallible operations in this crate return [`Result`], whose error type
//! is the [`NeritaError`] enum. The taxonomy mirrors the failure model of the
//! distributed index: backend I/O problems are recoverable and retried by the
//! cache flush cycle, per-peer transfer problems are absorbed by the
//! distribution and search orchestration layers, and only quorum-level
//! distribution failures and dump-file corruption propagate to callers.

use std::io;

use thiserror::Error;

/// The main error type for Nerita operations.
#[derive(Error, Debug)]
pub enum NeritaError {
    /// I/O errors (dump files, backend stores).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index-related errors (cache, container handling).
    #[error("Index error: {0}")]
    Index(String),

    /// Persistent-store errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Distribution errors that reached quorum level (insufficient eligible
    /// peers, or fewer successful transfers than required). Per-peer
    /// transfer failures never surface as this variant.
    #[error("Distribution error: {0}")]
    Distribution(String),

    /// Query-related errors (malformed queries, bad ranking profiles).
    #[error("Query error: {0}")]
    Query(String),

    /// A persisted dump file failed its integrity check during restore.
    /// This is the one fatal startup condition; operator intervention is
    /// expected.
    #[error("Corrupted dump: {0}")]
    Corruption(String),

    /// Serialization error (dump rows, transfer payloads).
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// JSON serialization/deserialization errors (ranking profiles).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with NeritaError.
pub type Result<T> = std::result::Result<T, NeritaError>;

impl NeritaError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        NeritaError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        NeritaError::Storage(msg.into())
    }

    /// Create a new distribution error.
    pub fn distribution<S: Into<String>>(msg: S) -> Self {
        NeritaError::Distribution(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        NeritaError::Query(msg.into())
    }

    /// Create a new corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        NeritaError::Corruption(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        NeritaError::SerializationError(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        NeritaError::Other(msg.into())
    }
}
