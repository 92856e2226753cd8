//! Artifact blob storage.
//!
//! [`BlobStore`] is the seam the reconciliation loop uploads through.
//! Two implementations are provided: [`S3BlobStore`] for S3-compatible
//! object storage (Cloudflare R2) and [`LocalBlobStore`] for a directory on
//! local disk.

pub mod local;
pub mod s3;

use async_trait::async_trait;

pub use local::LocalBlobStore;
pub use s3::{S3BlobStore, S3Config};

/// Content type of every job artifact.
pub const CONTENT_TYPE_PNG: &str = "image/png";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob key: {0:?}")]
    InvalidKey(String),

    #[error("Blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob backend error: {0}")]
    Backend(String),
}

/// Keyed byte storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Read the object stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}
