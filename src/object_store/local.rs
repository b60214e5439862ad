use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{content_disposition, ObjectStore, ObjectStoreError, PutRequest};
use crate::progress::ProgressSink;

/// Local filesystem object store for development and testing.
///
/// Parts are appended to `<key>.partial`, which is renamed into place once
/// every part has been written.
pub struct LocalStore {
    base_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{key}.meta.json"))
    }

    fn partial_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{key}.partial"))
    }

    /// Read back the content type and metadata stored with an object.
    pub async fn metadata(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
        let path = self.sidecar_path(key);
        if !path.exists() {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        let raw = tokio::fs::read(&path).await?;
        serde_json::from_slice(&raw).map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }

    async fn write_parts(
        &self,
        request: &PutRequest,
        partial: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), ObjectStoreError> {
        let mut source = File::open(&request.local_path).await?;
        let size = source.metadata().await?.len();
        let part_size = request.settings.part_size.max(1);

        let mut dest = File::create(partial).await?;
        let mut written = 0u64;
        while written < size {
            if cancel.is_cancelled() {
                return Err(ObjectStoreError::Cancelled);
            }
            let len = part_size.min(size - written);
            let copied = tokio::io::copy(&mut (&mut source).take(len), &mut dest).await?;
            if copied == 0 {
                return Err(ObjectStoreError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            written += copied;
            progress.update(written, size).await;
        }
        dest.flush().await?;

        if size == 0 {
            progress.update(0, 0).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_multipart(
        &self,
        request: &PutRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<(), ObjectStoreError> {
        let path = self.object_path(&request.key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = self.partial_path(&request.key);
        if let Err(e) = self
            .write_parts(request, &partial, progress.as_ref(), cancel)
            .await
        {
            // abort: nothing of this upload may remain visible
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &path).await?;

        let meta = ObjectMeta {
            content_type: request.content_type.clone(),
            metadata: request.metadata.clone(),
        };
        let raw = serde_json::to_vec(&meta).map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        tokio::fs::write(self.sidecar_path(&request.key), raw).await?;
        Ok(())
    }

    async fn presigned_url(
        &self,
        key: &str,
        ttl: Duration,
        download_name: &str,
    ) -> Result<String, ObjectStoreError> {
        let path = self.object_path(key);
        if !path.exists() {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!(
            "file://{}?expires={expires}&response-content-disposition={}",
            path.display(),
            urlencoding::encode(&content_disposition(download_name))
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        for path in [self.object_path(key), self.sidecar_path(key)] {
            if path.exists() {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.object_path(key);
        Ok(path.exists())
    }
}
