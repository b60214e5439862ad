use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::error::Rejection;
use super::job::{Job, JobSnapshot, OwnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Signalled,
    NotFound,
}

/// Active jobs keyed by owner.
///
/// All mutations go through one lock so the "one active job per owner"
/// check and the insert happen atomically.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<OwnerId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<OwnerId, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job unless its owner already has a non-terminal one.
    pub fn create(&self, job: Arc<Job>) -> Result<(), Rejection> {
        let mut jobs = self.jobs();
        if let Some(existing) = jobs.get(&job.owner_id) {
            if !existing.phase().is_terminal() {
                return Err(Rejection::AlreadyActive);
            }
        }
        jobs.insert(job.owner_id.clone(), job);
        Ok(())
    }

    pub fn get(&self, owner_id: &OwnerId) -> Option<Arc<Job>> {
        self.jobs().get(owner_id).cloned()
    }

    /// Remove whatever job the owner has. Removing nothing is not an error.
    pub fn remove(&self, owner_id: &OwnerId) -> Option<Arc<Job>> {
        self.jobs().remove(owner_id)
    }

    /// Remove `job` only if it is still the owner's registered job.
    pub fn remove_job(&self, job: &Job) -> bool {
        let mut jobs = self.jobs();
        match jobs.get(&job.owner_id) {
            Some(current) if current.id == job.id => {
                jobs.remove(&job.owner_id);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, owner_id: &OwnerId) -> CancelOutcome {
        match self.get(owner_id) {
            Some(job) if !job.phase().is_terminal() => {
                job.cancel();
                CancelOutcome::Signalled
            }
            _ => CancelOutcome::NotFound,
        }
    }

    /// Signal every active job. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let jobs: Vec<Arc<Job>> = self.jobs().values().cloned().collect();
        jobs.iter()
            .filter(|job| !job.phase().is_terminal())
            .inspect(|job| job.cancel())
            .count()
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Job>> = self.jobs().values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = jobs.iter().map(|job| job.snapshot()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}
