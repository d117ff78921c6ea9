//! The scheduler decides when each device's jobs run.
//!
//! A single task owns every job: its trigger, its next run time, and the
//! channel to the device controller that executes it. The scheduler never
//! runs job bodies itself; it hands a [`JobRun`] to the controller and moves
//! on, so a device sitting through a settle window never delays another
//! device's ticks.
//!
//! # Dispatch rules
//!
//! - **Pause.** A paused job is not dispatched and does not advance. Its due
//!   time stays in the past until it is resumed.
//! - **Coalescing.** When a job becomes runnable with several fire times
//!   behind it, they collapse into one run for the most recent of them.
//! - **Misfire grace.** If even that most recent fire time is older than
//!   [`MISFIRE_GRACE`], the run is dropped and reported as missed.
//! - **One instance per device.** Controller channels hold one queued run
//!   behind the one executing. If the channel is full the run is skipped. A
//!   queued run that waited past [`MISFIRE_GRACE`] is dropped by the
//!   controller as missed.
//!
//! Job outcomes are reported to listeners as [`JobEvent`]s, from the
//! scheduler for dispatch decisions and from controllers for execution.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use slotmap::SlotMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ScheduleEntry;
use crate::device::Setting;
use crate::job::{JobGroup, JobHandle};
use crate::tracing::prelude::*;
use crate::trigger::{IntervalTrigger, Trigger};

/// Unique identifier for a job, assigned by the scheduler.
pub type JobId = slotmap::DefaultKey;

/// Offset between the first throttle ticks of consecutive devices.
pub const STAGGER: Duration = Duration::from_millis(200);

/// Runs later than this behind their fire time are dropped.
pub const MISFIRE_GRACE: Duration = Duration::from_secs(30);

/// What a job does when it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Read telemetry and adjust frequency if warranted
    Throttle,
    /// Apply a scheduled setting
    Command(Setting),
}

/// One dispatched execution of a job.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job: JobId,
    pub name: String,
    pub action: JobAction,
    /// Fire time this run stands for
    pub scheduled: Instant,
}

/// Outcome of a job's fire time.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Executed {
        job: JobId,
        name: String,
    },
    /// The job returned an error or panicked
    Failed {
        job: JobId,
        name: String,
        error: String,
    },
    Missed {
        job: JobId,
        name: String,
        late: Duration,
    },
    /// The device was still busy with an earlier run
    Skipped {
        job: JobId,
        name: String,
    },
}

impl JobEvent {
    pub fn job(&self) -> JobId {
        match self {
            JobEvent::Executed { job, .. }
            | JobEvent::Failed { job, .. }
            | JobEvent::Missed { job, .. }
            | JobEvent::Skipped { job, .. } => *job,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            JobEvent::Executed { name, .. }
            | JobEvent::Failed { name, .. }
            | JobEvent::Missed { name, .. }
            | JobEvent::Skipped { name, .. } => name,
        }
    }
}

type Listener = Arc<dyn Fn(&JobEvent) + Send + Sync>;

/// Event listeners, shared between the scheduler and device controllers.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Listener>>>,
}

impl Listeners {
    pub fn add(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub fn emit(&self, event: &JobEvent) {
        let listeners = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.read().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("Listeners").field("count", &count).finish()
    }
}

/// What a device controller needs from the scheduler.
#[derive(Debug)]
pub struct DeviceJobs {
    /// Runs dispatched to this device
    pub runs: mpsc::Receiver<JobRun>,
    /// Every job of this device
    pub group: JobGroup,
    /// The periodic throttle job
    pub throttle: JobId,
}

/// Internal scheduler tracking for a registered job.
struct JobEntry {
    name: String,
    trigger: Trigger,
    /// `None` once the trigger will never fire again
    next_run: Option<Instant>,
    action: JobAction,
    handle: JobHandle,
    runs: mpsc::Sender<JobRun>,
}

pub struct Scheduler {
    jobs: SlotMap<JobId, JobEntry>,
    wake: Arc<Notify>,
    listeners: Listeners,
    origin: Instant,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: SlotMap::new(),
            wake: Arc::new(Notify::new()),
            listeners: Listeners::default(),
            origin: Instant::now(),
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&JobEvent) + Send + Sync + 'static) {
        self.listeners.add(listener);
    }

    /// Listener set to hand to device controllers.
    pub fn listeners(&self) -> Listeners {
        self.listeners.clone()
    }

    /// Register a device's throttle job and scheduled commands.
    ///
    /// The throttle job first fires `index` × [`STAGGER`] after the scheduler
    /// was created, then every `refresh`.
    pub fn add_device(
        &mut self,
        index: usize,
        host: &str,
        refresh: Duration,
        schedule: &[ScheduleEntry],
    ) -> DeviceJobs {
        let (runs_tx, runs) = mpsc::channel(1);
        let mut group = JobGroup::new();

        let start = self.origin + STAGGER * index as u32;
        let throttle = self.insert(
            format!("{host} throttle"),
            Trigger::Interval(IntervalTrigger::new(refresh, start)),
            JobAction::Throttle,
            runs_tx.clone(),
            &mut group,
        );

        for entry in schedule {
            self.insert(
                format!("{host} {}", entry.setting),
                Trigger::Cron(entry.trigger.clone()),
                JobAction::Command(entry.setting.clone()),
                runs_tx.clone(),
                &mut group,
            );
        }

        debug!(host, jobs = schedule.len() + 1, "Device registered");

        DeviceJobs {
            runs,
            group,
            throttle,
        }
    }

    fn insert(
        &mut self,
        name: String,
        trigger: Trigger,
        action: JobAction,
        runs: mpsc::Sender<JobRun>,
        group: &mut JobGroup,
    ) -> JobId {
        let handle = JobHandle::new(name.clone(), self.wake.clone());
        group.push(handle.clone());

        let next_run = trigger.first_fire_time(Instant::now());
        if next_run.is_none() {
            warn!(job = %name, "Job will never fire");
        }

        self.jobs.insert(JobEntry {
            name,
            trigger,
            next_run,
            action,
            handle,
            runs,
        })
    }

    pub fn next_run_time(&self, job: JobId) -> Option<Instant> {
        self.jobs.get(job).and_then(|entry| entry.next_run)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(jobs = self.jobs.len(), "Scheduler started");

        loop {
            self.dispatch_due(Instant::now());

            let wake = self.wake.clone();
            let next = self.next_wakeup();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = wake.notified() => {}
                _ = sleep_until(next) => {}
            }
        }

        debug!("Scheduler stopped");
    }

    /// Earliest due time among runnable jobs.
    fn next_wakeup(&self) -> Option<Instant> {
        self.jobs
            .values()
            .filter(|entry| !entry.handle.is_paused())
            .filter_map(|entry| entry.next_run)
            .min()
    }

    fn dispatch_due(&mut self, now: Instant) {
        for (id, entry) in self.jobs.iter_mut() {
            if entry.handle.is_paused() {
                continue;
            }
            let Some(due) = entry.next_run.filter(|due| *due <= now) else {
                continue;
            };

            let (scheduled, count) = entry.trigger.backlog(due, now).unwrap_or((due, 1));
            if count > 1 {
                debug!(job = %entry.name, count, "Coalescing missed runs");
            }
            entry.next_run = entry.trigger.next_fire_time(scheduled);

            let late = now.saturating_duration_since(scheduled);
            if late > MISFIRE_GRACE {
                warn!(job = %entry.name, late = ?late, "Run missed by more than the grace time");
                self.listeners.emit(&JobEvent::Missed {
                    job: id,
                    name: entry.name.clone(),
                    late,
                });
                continue;
            }

            let run = JobRun {
                job: id,
                name: entry.name.clone(),
                action: entry.action.clone(),
                scheduled,
            };
            match entry.runs.try_send(run) {
                Ok(()) => trace!(job = %entry.name, "Run dispatched"),
                Err(TrySendError::Full(_)) => {
                    warn!(job = %entry.name, "Device busy, skipping run");
                    self.listeners.emit(&JobEvent::Skipped {
                        job: id,
                        name: entry.name.clone(),
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    error!(job = %entry.name, "Device controller is gone, removing job");
                    entry.next_run = None;
                    self.listeners.emit(&JobEvent::Failed {
                        job: id,
                        name: entry.name.clone(),
                        error: "device controller stopped".into(),
                    });
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const REFRESH: Duration = Duration::from_secs(5);

    fn recorder(scheduler: &Scheduler) -> Arc<Mutex<Vec<JobEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        scheduler.add_listener(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_ticks_are_staggered() {
        let origin = Instant::now();
        let mut scheduler = Scheduler::new();

        let jobs: Vec<_> = ["10.0.0.21", "10.0.0.22", "10.0.0.23"]
            .iter()
            .enumerate()
            .map(|(index, host)| scheduler.add_device(index, host, REFRESH, &[]))
            .collect();

        let offsets: Vec<_> = jobs
            .iter()
            .map(|device| scheduler.next_run_time(device.throttle).unwrap() - origin)
            .collect();
        assert_eq!(
            offsets,
            [
                Duration::ZERO,
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test]
    async fn test_stagger_holds_on_a_running_clock() {
        let mut scheduler = Scheduler::new();

        // Registration happens after the scheduler was created, as in the daemon
        tokio::time::sleep(Duration::from_millis(50)).await;
        let jobs: Vec<_> = ["10.0.0.21", "10.0.0.22", "10.0.0.23"]
            .iter()
            .enumerate()
            .map(|(index, host)| scheduler.add_device(index, host, REFRESH, &[]))
            .collect();

        let offsets: Vec<_> = jobs
            .iter()
            .map(|device| scheduler.next_run_time(device.throttle).unwrap() - scheduler.origin)
            .collect();
        assert_eq!(
            offsets,
            [
                Duration::ZERO,
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        // Device 0 is already due and goes out on the first pass
        let origin = scheduler.origin;
        let mut first = jobs.into_iter().next().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        let run = tokio::time::timeout(Duration::from_secs(1), first.runs.recv())
            .await
            .expect("first tick slipped past the stagger")
            .unwrap();
        assert_eq!(run.scheduled, origin);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_ticks_every_refresh() {
        let origin = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut device = scheduler.add_device(1, "10.0.0.22", REFRESH, &[]);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        for tick in 0..3u32 {
            let run = device.runs.recv().await.unwrap();
            assert_eq!(run.action, JobAction::Throttle);
            assert_eq!(run.scheduled, origin + STAGGER + REFRESH * tick);
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_collapses_backlog_into_one_run() {
        let origin = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut device = scheduler.add_device(0, "10.0.0.21", REFRESH, &[]);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        let first = device.runs.recv().await.unwrap();
        assert_eq!(first.scheduled, origin);

        // A reconfiguration holding the device for 12s spans ticks at 5s and 10s
        device.group.pause_all();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(device.runs.try_recv().is_err());
        device.group.resume_all();

        let catch_up = device.runs.recv().await.unwrap();
        assert_eq!(catch_up.scheduled, origin + Duration::from_secs(10));

        let next = device.runs.recv().await.unwrap();
        assert_eq!(next.scheduled, origin + Duration::from_secs(15));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_past_grace_is_missed() {
        let origin = Instant::now();
        let mut scheduler = Scheduler::new();
        let events = recorder(&scheduler);
        let refresh = Duration::from_secs(60);
        let mut device = scheduler.add_device(0, "10.0.0.21", refresh, &[]);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        device.runs.recv().await.unwrap();
        device.group.pause_all();
        tokio::time::sleep(Duration::from_secs(100)).await;
        device.group.resume_all();

        // The 60s tick is 40s late; the next one at 120s runs normally
        let next = device.runs.recv().await.unwrap();
        assert_eq!(next.scheduled, origin + Duration::from_secs(120));

        let events = events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [JobEvent::Missed { late, .. }] if *late == Duration::from_secs(40)
        ));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_device_skips_run() {
        let mut scheduler = Scheduler::new();
        let events = recorder(&scheduler);
        let device = scheduler.add_device(0, "10.0.0.21", REFRESH, &[]);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        // Nobody consumes runs: the first fills the channel, the second is skipped
        tokio::time::sleep(Duration::from_secs(6)).await;

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], JobEvent::Skipped { .. }));
            assert_eq!(events[0].name(), "10.0.0.21 throttle");
        }

        shutdown.cancel();
        task.await.unwrap();
        drop(device);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_controller_fails_job() {
        let mut scheduler = Scheduler::new();
        let events = recorder(&scheduler);
        let device = scheduler.add_device(0, "10.0.0.21", REFRESH, &[]);
        let throttle = device.throttle;
        drop(device);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(30)).await;

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1, "job kept firing after failure");
            assert!(matches!(events[0], JobEvent::Failed { .. }));
            assert_eq!(events[0].job(), throttle);
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_per_device() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.add_device(0, "10.0.0.21", REFRESH, &[]);
        let b = scheduler.add_device(1, "10.0.0.22", REFRESH, &[]);

        a.group.pause_all();
        assert!(!a.group.all_active());
        assert!(b.group.all_active());
        assert!(scheduler.next_wakeup().is_some());
    }
}
