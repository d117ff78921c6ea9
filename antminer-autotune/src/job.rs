//! Job handles and per-device job groups.
//!
//! Every device owns one periodic throttle job plus one job per scheduled
//! command. The scheduler holds the trigger and next run time for each job;
//! the handles here carry only the active/paused flag that both sides share.
//!
//! Pausing is cooperative. A paused job is simply not dispatched by the
//! scheduler; nothing blocks on it. A run that is already executing is not
//! interrupted.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Two-state job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active,
    Paused,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Active => f.write_str("active"),
            JobState::Paused => f.write_str("paused"),
        }
    }
}

struct JobShared {
    name: String,
    paused: AtomicBool,
    /// Scheduler wake-up, poked on resume so catch-up runs are not delayed
    /// until the next unrelated timer.
    wake: Arc<Notify>,
}

/// Shared handle to one scheduled job.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobShared>,
}

impl JobHandle {
    pub(crate) fn new(name: impl Into<String>, wake: Arc<Notify>) -> Self {
        Self {
            inner: Arc::new(JobShared {
                name: name.into(),
                paused: AtomicBool::new(false),
                wake,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> JobState {
        if self.is_paused() {
            JobState::Paused
        } else {
            JobState::Active
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Pause the job. Returns false if it was already paused.
    pub fn pause(&self) -> bool {
        !self.inner.paused.swap(true, Ordering::AcqRel)
    }

    /// Resume the job. Returns false if it was already active.
    pub fn resume(&self) -> bool {
        let changed = self.inner.paused.swap(false, Ordering::AcqRel);
        if changed {
            self.inner.wake.notify_one();
        }
        changed
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// All jobs belonging to a single device, paused and resumed as a unit.
#[derive(Debug, Clone, Default)]
pub struct JobGroup {
    jobs: Vec<JobHandle>,
}

impl JobGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: JobHandle) {
        self.jobs.push(job);
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobHandle> {
        self.jobs.iter()
    }

    /// Pause every job in the group. Already-paused jobs are left alone.
    pub fn pause_all(&self) {
        for job in &self.jobs {
            job.pause();
        }
    }

    /// Resume every job in the group. Already-active jobs are left alone.
    pub fn resume_all(&self) {
        for job in &self.jobs {
            job.resume();
        }
    }

    /// Pause the group until the returned guard is dropped.
    ///
    /// Dropping the guard resumes every job, including when the holder
    /// returns early with an error or unwinds from a panic.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.pause_all();
        PauseGuard { group: self }
    }

    pub fn all_active(&self) -> bool {
        self.jobs.iter().all(|job| job.state() == JobState::Active)
    }
}

/// Resumes a [`JobGroup`] on drop.
#[must_use = "dropping the guard immediately resumes the group"]
pub struct PauseGuard<'a> {
    group: &'a JobGroup,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.group.resume_all();
    }
}
