// Attachment storage behind the `BlobStore` capability.

pub mod blobs;
pub mod error;

pub use blobs::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use error::{Result, StoreError};
