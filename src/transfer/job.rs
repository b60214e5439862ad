use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressSnapshot;

/// Identifies a single upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The user a job belongs to. At most one active job exists per owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for OwnerId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Downloading,
    Uploading,
    LinkIssued,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Title used in progress messages.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Downloading => "Downloading",
            Phase::Uploading => "Uploading",
            Phase::LinkIssued => "Generating link",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Cancelled => "Cancelled",
        }
    }
}

struct PhaseState {
    phase: Phase,
    started: Instant,
}

/// One in-flight transfer. Shared between the registry and the task driving it.
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    /// Where status messages for this job go.
    pub chat_id: String,
    pub original_name: String,
    pub safe_name: String,
    pub local_path: PathBuf,
    pub declared_size: u64,
    pub started_at: DateTime<Utc>,
    state: Mutex<PhaseState>,
    phase_total: AtomicU64,
    transferred: AtomicU64,
    cancel: CancellationToken,
}

impl Job {
    pub fn new(
        owner_id: OwnerId,
        chat_id: impl Into<String>,
        original_name: impl Into<String>,
        safe_name: impl Into<String>,
        local_path: PathBuf,
        declared_size: u64,
    ) -> Self {
        Self {
            id: JobId::new(),
            owner_id,
            chat_id: chat_id.into(),
            original_name: original_name.into(),
            safe_name: safe_name.into(),
            local_path,
            declared_size,
            started_at: Utc::now(),
            state: Mutex::new(PhaseState {
                phase: Phase::Downloading,
                started: Instant::now(),
            }),
            phase_total: AtomicU64::new(declared_size),
            transferred: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Move to a transfer phase, restarting the byte counter and phase clock.
    pub(crate) fn enter(&self, phase: Phase, total: u64) {
        let mut state = self.state();
        state.phase = phase;
        state.started = Instant::now();
        self.phase_total.store(total, Ordering::SeqCst);
        self.transferred.store(0, Ordering::SeqCst);
    }

    /// Record the terminal phase. Counters keep their last values.
    pub(crate) fn finish(&self, phase: Phase) {
        debug_assert!(phase.is_terminal());
        self.state().phase = phase;
    }

    pub(crate) fn record_progress(&self, done: u64) {
        self.transferred.fetch_max(done, Ordering::SeqCst);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let (phase, elapsed) = {
            let state = self.state();
            (state.phase, state.started.elapsed())
        };
        JobSnapshot {
            job_id: self.id,
            owner_id: self.owner_id.clone(),
            file_name: self.original_name.clone(),
            phase,
            started_at: self.started_at,
            progress: ProgressSnapshot::new(
                self.transferred_bytes(),
                self.phase_total.load(Ordering::SeqCst),
                elapsed,
            ),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("safe_name", &self.safe_name)
            .field("phase", &self.phase())
            .field("transferred", &self.transferred_bytes())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a job, returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub file_name: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
}
