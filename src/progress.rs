//! Rate-limited progress messages for running jobs.
//!
//! Both transfer phases push `(current, total)` pairs through a
//! [`ProgressSink`]. The [`ProgressReporter`] decides which of those become a
//! status-message edit: at most one per interval per job, never going
//! backwards, and always the final `current == total` update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::format::{clock, eta, human_size, rate};
use crate::notifier::{MessageHandle, Notifier, NotifierError};
use crate::transfer::{JobId, Phase};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1500);

const BAR_SEGMENTS: usize = 20;

/// Receives byte counts from a running transfer.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, done: u64, total: u64);
}

/// Sink that discards everything.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn update(&self, _done: u64, _total: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub elapsed_seconds: f64,
    /// Bytes per second since the phase started.
    pub rate: f64,
    pub percent: f64,
}

impl ProgressSnapshot {
    pub fn new(bytes_done: u64, bytes_total: u64, elapsed: Duration) -> Self {
        let percent = if bytes_total > 0 {
            bytes_done as f64 / bytes_total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            bytes_done,
            bytes_total,
            elapsed_seconds: elapsed.as_secs_f64(),
            rate: rate(bytes_done, elapsed),
            percent,
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        eta(self.bytes_total.saturating_sub(self.bytes_done), self.rate)
    }
}

/// Fixed-width bar, e.g. `▰▰▰▰▰▱▱▱▱▱▱▱▱▱▱▱▱▱▱▱` for 25%.
pub fn progress_bar(percent: f64) -> String {
    let filled = ((percent.max(0.0) / 100.0) * BAR_SEGMENTS as f64).floor() as usize;
    let filled = filled.min(BAR_SEGMENTS);
    format!(
        "{}{}",
        "▰".repeat(filled),
        "▱".repeat(BAR_SEGMENTS - filled)
    )
}

pub fn render_progress(phase: Phase, snapshot: &ProgressSnapshot) -> String {
    let eta = match snapshot.eta() {
        Some(eta) if !eta.is_zero() => clock(eta),
        _ => "Calculating...".to_string(),
    };
    format!(
        "*{label}...*\n\n`{bar}`\n*Progress:* `{percent:.1}%`\n*Size:* `{done} / {total}`\n*Speed:* `{speed}/s`\n*ETA:* `{eta}`",
        label = phase.label(),
        bar = progress_bar(snapshot.percent),
        percent = snapshot.percent,
        done = human_size(snapshot.bytes_done as f64),
        total = human_size(snapshot.bytes_total as f64),
        speed = human_size(snapshot.rate),
    )
}

struct Slot {
    message: Option<MessageHandle>,
    phase: Phase,
    phase_started: Instant,
    last_emit: Option<Instant>,
    last_current: u64,
    completed: bool,
    muted_until: Option<Instant>,
}

impl Slot {
    fn restart(&mut self, phase: Phase) {
        self.phase = phase;
        self.phase_started = Instant::now();
        self.last_emit = None;
        self.last_current = 0;
        self.completed = false;
    }
}

type SlotRef = Arc<tokio::sync::Mutex<Slot>>;

/// Turns transfer progress into throttled status-message edits.
pub struct ProgressReporter {
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    slots: Mutex<HashMap<JobId, SlotRef>>,
}

impl ProgressReporter {
    pub fn new(notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            notifier,
            interval,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<JobId, SlotRef>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, job_id: &JobId) -> Option<SlotRef> {
        self.slots().get(job_id).cloned()
    }

    /// Start tracking a job. Without a message handle updates are computed but
    /// have nowhere to go.
    pub fn register(&self, job_id: JobId, message: Option<MessageHandle>) {
        let slot = Slot {
            message,
            phase: Phase::Downloading,
            phase_started: Instant::now(),
            last_emit: None,
            last_current: 0,
            completed: false,
            muted_until: None,
        };
        self.slots()
            .insert(job_id, Arc::new(tokio::sync::Mutex::new(slot)));
    }

    pub fn unregister(&self, job_id: &JobId) {
        self.slots().remove(job_id);
    }

    pub async fn start_phase(&self, job_id: &JobId, phase: Phase) {
        if let Some(slot) = self.slot(job_id) {
            slot.lock().await.restart(phase);
        }
    }

    /// Offer a progress update. Returns whether it was pushed to the notifier.
    pub async fn report(&self, job_id: &JobId, current: u64, total: u64, phase: Phase) -> bool {
        let Some(slot) = self.slot(job_id) else {
            return false;
        };
        let mut slot = slot.lock().await;

        if slot.phase != phase {
            slot.restart(phase);
        }

        let current = if total > 0 { current.min(total) } else { current };
        let terminal = current == total;
        let now = Instant::now();

        if current < slot.last_current || slot.completed {
            return false;
        }
        if !terminal {
            if slot.last_emit.is_some_and(|last| now - last < self.interval) {
                return false;
            }
            if slot.muted_until.is_some_and(|until| now < until) {
                return false;
            }
        }

        slot.last_emit = Some(now);
        slot.last_current = current;
        slot.completed = terminal;

        let Some(message) = slot.message.clone() else {
            return false;
        };

        let snapshot = ProgressSnapshot::new(current, total, now - slot.phase_started);
        let text = render_progress(phase, &snapshot);

        match self.notifier.edit(&message, &text, &[]).await {
            Ok(()) => true,
            Err(NotifierError::RateLimited { retry_after }) => {
                tracing::warn!(
                    job_id = %job_id,
                    retry_after_secs = retry_after.as_secs(),
                    "Progress update rate limited"
                );
                slot.muted_until = Some(now + retry_after);
                false
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Progress update failed");
                false
            }
        }
    }
}
