use thiserror::Error;

use veil_shared::BlobId;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No blob is stored under this id.
    #[error("Blob not found: {0}")]
    BlobNotFound(BlobId),

    /// A write would push the blob past the configured limit.
    #[error("Blob too large: {size} bytes (max {max})")]
    BlobTooLarge { size: u64, max: u64 },

    /// A read asked for bytes past the end of the blob.
    #[error("Read out of range: offset {offset} on a {size}-byte blob")]
    OutOfRange { offset: u64, size: u64 },

    /// The resolved path escaped the storage directory.
    #[error("Path traversal detected")]
    PathTraversal,

    /// Generic I/O error (e.g. creating the storage directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
