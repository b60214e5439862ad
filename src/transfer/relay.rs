use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::{Rejection, TransferError};
use super::job::{Job, JobId, JobSnapshot, OwnerId, Phase};
use super::registry::{CancelOutcome, JobRegistry};
use super::ContentSource;
use crate::format::human_size;
use crate::notifier::{code_span, LinkButton, MessageHandle, Notifier};
use crate::object_store::{MultipartSettings, ObjectStore, PutRequest};
use crate::progress::{ProgressReporter, ProgressSink};
use crate::sanitize::sanitize_filename;

const DRAIN_POLL: Duration = Duration::from_millis(50);
const LINK_PREVIEW_CHARS: usize = 60;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Root of the per-owner staging directories.
    pub staging_dir: PathBuf,
    pub max_file_size: u64,
    pub link_ttl: Duration,
    pub multipart: MultipartSettings,
}

/// An inbound file waiting to be relayed.
pub struct UploadRequest {
    pub owner_id: OwnerId,
    pub chat_id: String,
    /// Name as given by the sender, if any.
    pub file_name: Option<String>,
    /// Declared size in bytes, 0 when unknown.
    pub size: u64,
    pub source: Box<dyn ContentSource>,
}

pub struct Accepted {
    pub job_id: JobId,
    /// Resolves once the job has been cleaned up and the requester told.
    pub completion: JoinHandle<JobOutcome>,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub key: String,
    pub url: String,
    pub size: u64,
    pub content_type: String,
    pub download_time: Duration,
    pub upload_time: Duration,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Delivery),
    Failed(String),
    Cancelled,
}

impl JobOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            JobOutcome::Completed(_) => Phase::Completed,
            JobOutcome::Failed(_) => Phase::Failed,
            JobOutcome::Cancelled => Phase::Cancelled,
        }
    }
}

/// Directory and key segment for an owner.
///
/// Percent-encoded with `.` escaped as well, so distinct owners never share a
/// segment and `.`/`..` cannot appear. Every `%` an encoding produces is
/// followed by two hex digits, which leaves a bare `%` free for the empty id.
fn owner_segment(owner_id: &OwnerId) -> String {
    let id = owner_id.as_str();
    if id.is_empty() {
        return "%".to_string();
    }
    urlencoding::encode(id).replace('.', "%2E")
}

/// `<owner>/<unix millis>_<safe name>`, unique per upload attempt.
pub fn object_key(owner_id: &OwnerId, safe_name: &str) -> String {
    format!(
        "{}/{}_{}",
        owner_segment(owner_id),
        Utc::now().timestamp_millis(),
        safe_name
    )
}

fn object_metadata(job: &Job) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "original_filename".to_string(),
            urlencoding::encode(&job.original_name).into_owned(),
        ),
        ("owner_id".to_string(), job.owner_id.to_string()),
        (
            "upload_timestamp".to_string(),
            Utc::now().timestamp().to_string(),
        ),
    ])
}

/// Forwards store progress to the job counters and the reporter.
struct JobProgress {
    job: Arc<Job>,
    reporter: Arc<ProgressReporter>,
    phase: Phase,
}

#[async_trait]
impl ProgressSink for JobProgress {
    async fn update(&self, done: u64, total: u64) {
        self.job.record_progress(done);
        self.reporter
            .report(&self.job.id, done, total, self.phase)
            .await;
    }
}

/// Owns a job's staging file and registry entry until the job ends.
///
/// `release` is the normal exit. If the task unwinds or is aborted first,
/// `Drop` performs the same cleanup synchronously and marks the job failed.
struct StagingGuard {
    registry: Arc<JobRegistry>,
    reporter: Arc<ProgressReporter>,
    job: Arc<Job>,
    armed: bool,
}

impl StagingGuard {
    fn new(registry: Arc<JobRegistry>, reporter: Arc<ProgressReporter>, job: Arc<Job>) -> Self {
        Self {
            registry,
            reporter,
            job,
            armed: true,
        }
    }

    async fn release(mut self, phase: Phase) {
        // files go before the phase turns terminal; a resubmission may reuse the path
        if let Err(e) = tokio::fs::remove_file(&self.job.local_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    job_id = %self.job.id,
                    path = %self.job.local_path.display(),
                    error = %e,
                    "Failed to remove staging file"
                );
            }
        }
        if let Some(dir) = self.job.local_path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
        self.armed = false;
        self.finish(phase);
    }

    fn finish(&self, phase: Phase) {
        self.job.finish(phase);
        self.registry.remove_job(&self.job);
        self.reporter.unregister(&self.job.id);
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(job_id = %self.job.id, "Job ended without release, cleaning up");
        let _ = std::fs::remove_file(&self.job.local_path);
        if let Some(dir) = self.job.local_path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
        self.finish(Phase::Failed);
    }
}

/// Drives jobs from inbound transfer to an issued download link.
pub struct Relay {
    settings: RelaySettings,
    registry: Arc<JobRegistry>,
    reporter: Arc<ProgressReporter>,
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn Notifier>,
}

impl Relay {
    pub fn new(
        settings: RelaySettings,
        registry: Arc<JobRegistry>,
        reporter: Arc<ProgressReporter>,
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            registry,
            reporter,
            store,
            notifier,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// `<staging>/<owner>/<safe name>`. Owners never share a directory.
    fn staging_path(&self, owner_id: &OwnerId, safe_name: &str) -> PathBuf {
        self.settings
            .staging_dir
            .join(owner_segment(owner_id))
            .join(safe_name)
    }

    /// Accept an upload and start relaying it in the background.
    ///
    /// Rejections happen before anything is created or spawned.
    pub fn submit(self: &Arc<Self>, request: UploadRequest) -> Result<Accepted, Rejection> {
        let max = self.settings.max_file_size;
        if request.size > max {
            return Err(Rejection::TooLarge {
                size: request.size,
                max,
            });
        }

        let original_name = request
            .file_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("file_{}", Utc::now().timestamp()));
        let safe_name = sanitize_filename(&original_name);
        let local_path = self.staging_path(&request.owner_id, &safe_name);

        let job = Arc::new(Job::new(
            request.owner_id,
            request.chat_id,
            original_name,
            safe_name,
            local_path,
            request.size,
        ));
        self.registry.create(Arc::clone(&job))?;

        tracing::info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            file_name = %job.safe_name,
            size = job.declared_size,
            "Upload accepted"
        );

        let job_id = job.id;
        let relay = Arc::clone(self);
        let source = request.source;
        let completion = tokio::spawn(async move { relay.run(job, source).await });
        Ok(Accepted { job_id, completion })
    }

    pub fn cancel(&self, owner_id: &OwnerId) -> CancelOutcome {
        let outcome = self.registry.cancel(owner_id);
        if outcome == CancelOutcome::Signalled {
            tracing::info!(owner_id = %owner_id, "Cancellation requested");
        }
        outcome
    }

    pub fn status(&self, owner_id: &OwnerId) -> Option<JobSnapshot> {
        self.registry.get(owner_id).map(|job| job.snapshot())
    }

    pub fn active(&self) -> Vec<JobSnapshot> {
        self.registry.snapshots()
    }

    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    /// Wait for every job to finish cleanup. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.registry.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        true
    }

    async fn run(self: Arc<Self>, job: Arc<Job>, source: Box<dyn ContentSource>) -> JobOutcome {
        let guard = StagingGuard::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.reporter),
            Arc::clone(&job),
        );

        let message = match self
            .notifier
            .send(&job.chat_id, "📥 *Downloading file...*")
            .await
        {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to send status message");
                None
            }
        };
        self.reporter.register(job.id, message.clone());

        let outcome = match self.execute(&job, source.as_ref()).await {
            Ok(delivery) => JobOutcome::Completed(delivery),
            Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e.to_string()),
        };

        guard.release(outcome.phase()).await;

        match &outcome {
            JobOutcome::Completed(delivery) => tracing::info!(
                job_id = %job.id,
                owner_id = %job.owner_id,
                key = %delivery.key,
                size = delivery.size,
                "Upload completed"
            ),
            JobOutcome::Failed(reason) => tracing::error!(
                job_id = %job.id,
                owner_id = %job.owner_id,
                error = %reason,
                "Upload failed"
            ),
            JobOutcome::Cancelled => tracing::info!(
                job_id = %job.id,
                owner_id = %job.owner_id,
                "Upload cancelled"
            ),
        }

        self.announce(&job, message.as_ref(), &outcome).await;
        outcome
    }

    async fn execute(
        &self,
        job: &Arc<Job>,
        source: &dyn ContentSource,
    ) -> Result<Delivery, TransferError> {
        let download_started = Instant::now();
        let size = self.stage_in(job, source).await?;
        let download_time = download_started.elapsed();
        tracing::debug!(
            job_id = %job.id,
            bytes = size,
            elapsed_ms = download_time.as_millis() as u64,
            "Staged file locally"
        );

        let upload_started = Instant::now();
        let (key, content_type) = self.stage_out(job, size).await?;
        let upload_time = upload_started.elapsed();

        job.enter(Phase::LinkIssued, size);
        job.record_progress(size);
        if job.is_cancelled() {
            self.discard(&key).await;
            return Err(TransferError::Cancelled);
        }

        let url = match self
            .store
            .presigned_url(&key, self.settings.link_ttl, &job.original_name)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                self.discard(&key).await;
                return Err(e.into());
            }
        };

        Ok(Delivery {
            key,
            url,
            size,
            content_type,
            download_time,
            upload_time,
            expires_in: self.settings.link_ttl,
        })
    }

    /// Stream the source into the staging file. Returns the bytes received.
    async fn stage_in(&self, job: &Job, source: &dyn ContentSource) -> Result<u64, TransferError> {
        let declared = job.declared_size;
        let max = self.settings.max_file_size;
        let cancel = job.cancel_token();

        job.enter(Phase::Downloading, declared);
        self.reporter.start_phase(&job.id, Phase::Downloading).await;

        if let Some(dir) = job.local_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            stream = source.open() => stream?,
        };
        let mut file = File::create(&job.local_path).await?;

        let mut received = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            received += chunk.len() as u64;
            if received > max {
                return Err(TransferError::TooLarge { max });
            }
            if declared > 0 && received > declared {
                return Err(TransferError::SizeMismatch {
                    expected: declared,
                    received,
                });
            }

            file.write_all(&chunk).await?;
            job.record_progress(received);
            self.reporter
                .report(&job.id, received, declared, Phase::Downloading)
                .await;
        }
        file.flush().await?;
        drop(file);

        if declared > 0 && received != declared {
            return Err(TransferError::SizeMismatch {
                expected: declared,
                received,
            });
        }
        if declared == 0 {
            self.reporter
                .report(&job.id, received, received, Phase::Downloading)
                .await;
        }
        Ok(received)
    }

    /// Push the staged file to the store. Returns the key and content type.
    async fn stage_out(&self, job: &Arc<Job>, size: u64) -> Result<(String, String), TransferError> {
        job.enter(Phase::Uploading, size);
        self.reporter.start_phase(&job.id, Phase::Uploading).await;

        let content_type = mime_guess::from_path(&job.safe_name)
            .first_or_octet_stream()
            .to_string();
        let key = object_key(&job.owner_id, &job.safe_name);
        let request = PutRequest {
            local_path: job.local_path.clone(),
            key: key.clone(),
            content_type: content_type.clone(),
            metadata: object_metadata(job),
            settings: self.settings.multipart.clone(),
        };
        let progress = Arc::new(JobProgress {
            job: Arc::clone(job),
            reporter: Arc::clone(&self.reporter),
            phase: Phase::Uploading,
        });

        self.store
            .put_multipart(&request, progress, job.cancel_token())
            .await?;
        Ok((key, content_type))
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete uploaded object");
        }
    }

    async fn announce(&self, job: &Job, message: Option<&MessageHandle>, outcome: &JobOutcome) {
        let (text, buttons) = match outcome {
            JobOutcome::Completed(delivery) => {
                (completion_text(job, delivery), link_buttons(&delivery.url))
            }
            JobOutcome::Failed(reason) => (format!("❌ *Error:* {}", code_span(reason)), Vec::new()),
            JobOutcome::Cancelled => ("🛑 *Upload cancelled.*".to_string(), Vec::new()),
        };

        let result = match message {
            Some(message) => self.notifier.edit(message, &text, &buttons).await,
            None => match self.notifier.send(&job.chat_id, &text).await {
                Ok(sent) if !buttons.is_empty() => self.notifier.edit(&sent, &text, &buttons).await,
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to deliver final status");
        }
    }
}

fn link_buttons(url: &str) -> Vec<LinkButton> {
    vec![
        LinkButton::new("🔗 Direct Download", url),
        LinkButton::new(
            "📺 Open in MX Player",
            format!("intent:{url}#Intent;package=com.mxtech.videoplayer.ad;end"),
        ),
        LinkButton::new("🎬 Open in VLC", format!("vlc://{url}")),
    ]
}

fn expiry_notice(ttl: Duration) -> String {
    let secs = ttl.as_secs();
    if secs >= 3600 {
        format!("Links expire in {} hours.", secs / 3600)
    } else {
        format!("Links expire in {} minutes.", (secs / 60).max(1))
    }
}

fn completion_text(job: &Job, delivery: &Delivery) -> String {
    let total = (delivery.download_time + delivery.upload_time).as_secs_f64();
    let average = if total > 0.0 {
        delivery.size as f64 / total
    } else {
        0.0
    };
    let preview: String = delivery.url.chars().take(LINK_PREVIEW_CHARS).collect();

    format!(
        "✅ *Upload Complete!*\n\n\
         *File:* {name}\n\
         *Size:* `{size}`\n\
         *Download Time:* `{download:.1}s`\n\
         *Upload Time:* `{upload:.1}s`\n\
         *Average Speed:* `{speed}/s`\n\n\
         *Streaming Links:*\n\
         • Direct: {preview}\n\n\
         {expiry}",
        name = code_span(&job.original_name),
        size = human_size(delivery.size as f64),
        download = delivery.download_time.as_secs_f64(),
        upload = delivery.upload_time.as_secs_f64(),
        speed = human_size(average),
        preview = code_span(&format!("{preview}...")),
        expiry = expiry_notice(delivery.expires_in),
    )
}
