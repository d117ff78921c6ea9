//! Guarded write path for device reconfiguration.
//!
//! A reconfiguration pauses every job of the device, resets the device to its
//! baseline configuration, applies one setting, pushes the result with an
//! immediate restart, and waits for the device to settle before telemetry is
//! trusted again. The job group is resumed afterwards whatever happened.
//!
//! Failures are logged and returned. There is no retry and no rollback: the
//! next tick reads the device again and the control loop reconciles from what
//! it reports.

use std::time::Duration;

use crate::device::{DeviceClient, DeviceError, Setting};
use crate::job::JobGroup;
use crate::tracing::prelude::*;

/// How long a device is left alone after a configuration push.
pub const SETTLE_TIME: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct Sequencer {
    settle: Duration,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(SETTLE_TIME)
    }
}

impl Sequencer {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    /// Apply `setting` to the device behind `client`.
    ///
    /// `jobs` must be the device's own job group. It is paused for the whole
    /// sequence, including the settle window, and resumed before returning.
    pub async fn reconfigure<C>(
        &self,
        client: &mut C,
        jobs: &JobGroup,
        setting: &Setting,
    ) -> Result<(), DeviceError>
    where
        C: DeviceClient + ?Sized,
    {
        let _paused = jobs.pause();
        let host = client.host().to_string();

        info!(host = %host, setting = %setting, "Applying setting");

        match self.write(client, setting).await {
            Ok(()) => {
                info!(host = %host, setting = %setting, "Setting applied");
                Ok(())
            }
            Err(e) => {
                error!(
                    host = %host,
                    setting = %setting,
                    error = %e,
                    "Failed to apply setting"
                );
                Err(e)
            }
        }
    }

    async fn write<C>(&self, client: &mut C, setting: &Setting) -> Result<(), DeviceError>
    where
        C: DeviceClient + ?Sized,
    {
        client.reset_config().await?;
        client.set(setting).await?;
        client.push_config(true).await?;

        trace!(host = %client.host(), settle = ?self.settle, "Waiting for device to settle");
        tokio::time::sleep(self.settle).await;

        Ok(())
    }
}
