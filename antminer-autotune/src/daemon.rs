//! Daemon lifecycle management.
//!
//! The daemon builds one controller per configured miner, registers every
//! job with the scheduler, and runs until SIGINT or SIGTERM. On shutdown the
//! scheduler stops issuing runs immediately; controllers finish whatever run
//! they are in, settle window included, before exiting.

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::controller::DeviceController;
use crate::device::AntminerClient;
use crate::scheduler::{JobEvent, Scheduler};
use crate::tracing::prelude::*;

/// The main daemon.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut scheduler = Scheduler::new();
        scheduler.add_listener(log_job_event);

        for (index, miner) in self.config.miners.iter().enumerate() {
            let client = AntminerClient::new(miner)?;
            let jobs = scheduler.add_device(
                index,
                &miner.host,
                self.config.refresh_time,
                &miner.schedule,
            );

            let controller = DeviceController::new(
                miner.model.clone(),
                client,
                jobs.group,
                scheduler.listeners(),
            );
            self.tracker
                .spawn(controller.run(jobs.runs, self.shutdown.clone()));

            info!(
                host = %miner.host,
                min_freq = miner.model.min_freq,
                max_freq = miner.model.max_freq,
                scheduled = miner.schedule.len(),
                "Miner added"
            );
        }

        if self.config.miners.is_empty() {
            warn!("No miners configured");
        }

        self.tracker.spawn(scheduler.run(self.shutdown.clone()));
        self.tracker.close();

        info!(
            miners = self.config.miners.len(),
            refresh = ?self.config.refresh_time,
            "Started."
        );
        info!("For debugging, set RUST_LOG=antminer_autotune=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        self.shutdown.cancel();

        // Controllers may be mid-sequence
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Failure listener: anything a job did not handle itself ends up here.
fn log_job_event(event: &JobEvent) {
    match event {
        JobEvent::Failed { name, error, .. } => {
            error!(job = %name, error = %error, "Job raised an error");
        }
        JobEvent::Missed { name, late, .. } => {
            debug!(job = %name, late = ?late, "Job run missed");
        }
        JobEvent::Executed { .. } | JobEvent::Skipped { .. } => {}
    }
}
