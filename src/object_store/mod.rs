mod local;
mod s3;

pub use local::{LocalStore, ObjectMeta};
pub use s3::{S3Store, S3StoreConfig};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressSink;

/// Smallest part S3 accepts for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Most parts a single S3 multipart upload may have.
pub const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Upload cancelled")]
    Cancelled,
}

/// How a file is split when it is pushed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartSettings {
    /// Files smaller than this go up in a single request.
    pub threshold: u64,
    pub part_size: u64,
    /// Parts in flight at once.
    pub max_concurrency: usize,
}

impl Default for MultipartSettings {
    fn default() -> Self {
        Self {
            threshold: 25 * 1024 * 1024,
            part_size: 25 * 1024 * 1024,
            max_concurrency: 10,
        }
    }
}

impl MultipartSettings {
    pub fn part_count(&self, size: u64) -> u64 {
        size.div_ceil(self.part_size.max(1)).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub local_path: PathBuf,
    pub key: String,
    pub content_type: String,
    /// User metadata stored alongside the object. Values must be ASCII.
    pub metadata: BTreeMap<String, String>,
    pub settings: MultipartSettings,
}

/// Abstraction over object storage backends. Each store is bound to one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file, splitting it into parts when it crosses the
    /// threshold. A cancelled or failed upload leaves no object behind.
    async fn put_multipart(
        &self,
        request: &PutRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<(), ObjectStoreError>;

    /// A time-limited GET link that downloads as `download_name`.
    async fn presigned_url(
        &self,
        key: &str,
        ttl: Duration,
        download_name: &str,
    ) -> Result<String, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

/// `Content-Disposition` value that survives non-ASCII filenames.
pub fn content_disposition(download_name: &str) -> String {
    let fallback: String = download_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(download_name)
    )
}
