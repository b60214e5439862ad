use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{content_disposition, ObjectStore, ObjectStoreError, PutRequest};
use crate::progress::ProgressSink;

pub struct S3StoreConfig<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub endpoint_url: Option<&'a str>,
    pub force_path_style: bool,
}

/// S3-compatible object store (AWS, Wasabi, R2, MinIO).
pub struct S3Store {
    bucket: String,
    client: Client,
}

fn backend<E>(e: E) -> ObjectStoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ObjectStoreError::Backend(DisplayErrorContext(e).to_string())
}

/// Where one part lives in the staged file.
struct PartSpec {
    number: i32,
    offset: u64,
    len: u64,
}

impl S3Store {
    pub fn new(bucket: &str, config: &S3StoreConfig<'_>) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "file-relay",
        );

        let mut builder = S3ConfigBuilder::new()
            .credentials_provider(credentials)
            .region(Region::new(config.region.to_string()));

        if let Some(endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self::from_client(Client::from_conf(builder.build()), bucket)
    }

    pub fn from_client(client: Client, bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            client,
        }
    }

    fn metadata(request: &PutRequest) -> HashMap<String, String> {
        request
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn put_single(
        &self,
        request: &PutRequest,
        size: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), ObjectStoreError> {
        let body = ByteStream::from_path(&request.local_path)
            .await
            .map_err(backend)?;

        let send = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .set_metadata(Some(Self::metadata(request)))
            .body(body)
            .send();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ObjectStoreError::Cancelled),
            result = send => { result.map_err(backend)?; }
        }

        progress.update(size, size).await;
        Ok(())
    }

    async fn create_upload(&self, request: &PutRequest) -> Result<String, ObjectStoreError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .set_metadata(Some(Self::metadata(request)))
            .send()
            .await
            .map_err(backend)?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Backend("No upload ID returned".to_string()))
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        mut parts: Vec<CompletedPart>,
    ) -> Result<(), ObjectStoreError> {
        // S3 requires ascending part numbers
        parts.sort_by_key(|part| part.part_number());

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;

        match result {
            Ok(_) => tracing::debug!(key = %key, "Aborted multipart upload"),
            Err(e) => tracing::warn!(
                key = %key,
                upload_id = %upload_id,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload"
            ),
        }
    }

    async fn upload_parts(
        &self,
        request: &PutRequest,
        upload_id: &str,
        size: u64,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedPart>, ObjectStoreError> {
        let part_size = request.settings.part_size.max(1);
        let total_parts = request.settings.part_count(size);
        let semaphore = Arc::new(Semaphore::new(request.settings.max_concurrency.max(1)));
        let uploaded = Arc::new(AtomicU64::new(0));
        // Fires on user cancellation or when any part fails.
        let abort = cancel.child_token();
        let mut tasks = JoinSet::new();

        for index in 0..total_parts {
            let permit = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| ObjectStoreError::Backend(e.to_string()))?
                }
            };

            let offset = index * part_size;
            let part = PartSpec {
                number: (index + 1) as i32,
                offset,
                len: part_size.min(size - offset),
            };
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = request.key.clone();
            let upload_id = upload_id.to_string();
            let path = request.local_path.clone();
            let uploaded = Arc::clone(&uploaded);
            let progress = Arc::clone(&progress);
            let abort = abort.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let len = part.len;
                let result = tokio::select! {
                    biased;
                    _ = abort.cancelled() => Err(ObjectStoreError::Cancelled),
                    result = upload_part(&client, &bucket, &key, &upload_id, &path, part) => result,
                };
                match result {
                    Ok(completed) => {
                        let done = uploaded.fetch_add(len, Ordering::SeqCst) + len;
                        progress.update(done, size).await;
                        Ok(completed)
                    }
                    Err(e) => {
                        abort.cancel();
                        Err(e)
                    }
                }
            });
        }

        let mut parts = Vec::new();
        let mut first_error: Option<ObjectStoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok(part)) => {
                    parts.push(part);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => ObjectStoreError::Backend(format!("Part upload task failed: {e}")),
            };
            // a sibling's failure cancels the rest; keep the real cause
            match first_error {
                None | Some(ObjectStoreError::Cancelled) => first_error = Some(error),
                Some(_) => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(ObjectStoreError::Cancelled);
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(parts)
    }
}

async fn upload_part(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    path: &Path,
    part: PartSpec,
) -> Result<CompletedPart, ObjectStoreError> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(part.offset)).await?;
    let mut buffer = vec![0u8; part.len as usize];
    file.read_exact(&mut buffer).await?;

    let response = client
        .upload_part()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .part_number(part.number)
        .body(ByteStream::from(buffer))
        .send()
        .await
        .map_err(backend)?;

    Ok(CompletedPart::builder()
        .part_number(part.number)
        .e_tag(response.e_tag().unwrap_or_default())
        .build())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_multipart(
        &self,
        request: &PutRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<(), ObjectStoreError> {
        let size = tokio::fs::metadata(&request.local_path).await?.len();

        if size < request.settings.threshold {
            return self
                .put_single(request, size, progress.as_ref(), cancel)
                .await;
        }

        let upload_id = self.create_upload(request).await?;
        tracing::debug!(
            key = %request.key,
            parts = request.settings.part_count(size),
            "Started multipart upload"
        );

        let parts = match self
            .upload_parts(request, &upload_id, size, progress, cancel)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_upload(&request.key, &upload_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.complete_upload(&request.key, &upload_id, parts).await {
            self.abort_upload(&request.key, &upload_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn presigned_url(
        &self,
        key: &str,
        ttl: Duration,
        download_name: &str,
    ) -> Result<String, ObjectStoreError> {
        let presigning_config = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(backend)?;

        let presigned_request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .response_content_disposition(content_disposition(download_name))
            .presigned(presigning_config)
            .await
            .map_err(backend)?;

        Ok(presigned_request.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        // S3 treats deleting a missing key as success
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match e.as_service_error() {
                Some(service) if service.is_not_found() => Ok(false),
                _ => Err(backend(e)),
            },
        }
    }
}
