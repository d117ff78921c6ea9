//! Per-device executor.
//!
//! Each device gets one controller task. It owns the device's runtime state
//! and client outright and executes the runs the scheduler hands it, one at a
//! time, so telemetry read, decision, reconfiguration and resume never
//! interleave for a device.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceClient, DeviceError, DeviceModel, DeviceState, Setting};
use crate::job::JobGroup;
use crate::policy;
use crate::scheduler::{JobAction, JobEvent, JobRun, Listeners, MISFIRE_GRACE};
use crate::sequencer::Sequencer;
use crate::tracing::prelude::*;

pub struct DeviceController<C> {
    model: DeviceModel,
    state: DeviceState,
    client: C,
    sequencer: Sequencer,
    listeners: Listeners,
}

impl<C: DeviceClient> DeviceController<C> {
    pub fn new(model: DeviceModel, client: C, jobs: JobGroup, listeners: Listeners) -> Self {
        let state = DeviceState::new(client.host(), jobs);
        Self {
            model,
            state,
            client,
            sequencer: Sequencer::default(),
            listeners,
        }
    }

    pub fn with_sequencer(mut self, sequencer: Sequencer) -> Self {
        self.sequencer = sequencer;
        self
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Execute runs until shutdown or until the scheduler goes away.
    ///
    /// Shutdown is only observed between runs; a run in progress, settle
    /// window included, completes first.
    pub async fn run(mut self, mut runs: mpsc::Receiver<JobRun>, shutdown: CancellationToken) {
        debug!(host = %self.state.host(), "Controller started");

        loop {
            let run = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                run = runs.recv() => match run {
                    Some(run) => run,
                    None => break,
                },
            };
            self.execute(run).await;
        }

        debug!(host = %self.state.host(), "Controller stopped");
    }

    /// Execute one run and report its outcome to listeners.
    ///
    /// A panic inside the job is caught and reported like an error. A run
    /// that sat queued behind a long one for more than the misfire grace is
    /// dropped as missed.
    pub async fn execute(&mut self, run: JobRun) {
        let late = Instant::now().saturating_duration_since(run.scheduled);
        if late > MISFIRE_GRACE {
            warn!(job = %run.name, late = ?late, "Queued run missed by more than the grace time");
            self.listeners.emit(&JobEvent::Missed {
                job: run.job,
                name: run.name,
                late,
            });
            return;
        }

        trace!(job = %run.name, "Executing");

        let outcome = AssertUnwindSafe(self.perform(&run.action))
            .catch_unwind()
            .await;

        let event = match outcome {
            Ok(Ok(())) => JobEvent::Executed {
                job: run.job,
                name: run.name,
            },
            Ok(Err(e)) => JobEvent::Failed {
                job: run.job,
                name: run.name,
                error: e.to_string(),
            },
            Err(panic) => JobEvent::Failed {
                job: run.job,
                name: run.name,
                error: format!("panicked: {}", panic_message(&*panic)),
            },
        };
        self.listeners.emit(&event);
    }

    async fn perform(&mut self, action: &JobAction) -> Result<(), DeviceError> {
        match action {
            JobAction::Throttle => self.throttle().await,
            JobAction::Command(setting) => self.apply_command(setting).await,
        }
    }

    /// One control-loop tick.
    ///
    /// Telemetry failures skip the tick without touching state. State is
    /// committed only once the device accepted the new frequency.
    async fn throttle(&mut self) -> Result<(), DeviceError> {
        let telemetry = match self.client.read_telemetry().await {
            Ok(telemetry) => telemetry,
            Err(e) => {
                warn!(host = %self.state.host(), error = %e, "Failed to collect telemetry");
                return Ok(());
            }
        };

        info!(
            host = %self.state.host(),
            temp = telemetry.temperature,
            freq = telemetry.api_frequency,
            uptime = telemetry.elapsed.as_secs(),
            hr = %telemetry.hash_rate_avg,
            h5 = %telemetry.hash_rate_5s,
            hw = %format!("{:.4}%", telemetry.hardware_error_rate),
            "Status"
        );

        self.state.observe(telemetry.api_frequency, &self.model);
        let telemetry = self.state.effective(telemetry, Instant::now());

        let Some(decision) = policy::decide(&self.model, &self.state, &telemetry) else {
            return Ok(());
        };

        info!(
            host = %self.state.host(),
            adjustment = ?decision.adjustment,
            from = telemetry.api_frequency,
            to = decision.frequency,
            "Adjusting frequency"
        );

        self.sequencer
            .reconfigure(
                &mut self.client,
                self.state.jobs(),
                &Setting::Frequency(decision.frequency),
            )
            .await?;
        self.state.commit(&decision, Instant::now());

        Ok(())
    }

    /// Apply a scheduled setting.
    ///
    /// A forced frequency is clamped into the model's range and restarts the
    /// history from it.
    async fn apply_command(&mut self, setting: &Setting) -> Result<(), DeviceError> {
        let setting = match setting {
            Setting::Frequency(mhz) => {
                let clamped = self.model.clamp(*mhz);
                if clamped != *mhz {
                    warn!(
                        host = %self.state.host(),
                        requested = *mhz,
                        applied = clamped,
                        "Scheduled frequency out of range"
                    );
                }
                Setting::Frequency(clamped)
            }
            other => other.clone(),
        };

        self.sequencer
            .reconfigure(&mut self.client, self.state.jobs(), &setting)
            .await?;

        if let Setting::Frequency(mhz) = setting {
            self.state.record_forced(mhz, &self.model, Instant::now());
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
