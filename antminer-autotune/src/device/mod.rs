//! Device model, runtime state, and the client boundary.
//!
//! A [`DeviceModel`] holds the static tunables for a miner, a [`DeviceState`]
//! holds what the control loop has learned about it at runtime, and a
//! [`DeviceClient`] performs the actual network reads and writes.
//!
//! # Frequency history
//!
//! The history is a stack whose top is the frequency currently applied. It is
//! seeded from the first telemetry read, grows by one entry on every speed-up,
//! and shrinks by one entry on every cool-down, so a cool-down always returns
//! to exactly the frequency that preceded the last speed-up.

pub mod antminer;
pub mod cgminer;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::job::JobGroup;
use crate::policy::{Adjustment, Decision};
use crate::types::HashRate;

pub use antminer::AntminerClient;

/// Static per-device tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceModel {
    /// Lowest frequency the loop will ever select (MHz)
    pub min_freq: u32,
    /// Highest frequency the loop will ever select (MHz)
    pub max_freq: u32,
    /// Frequency increment per speed-up step (MHz)
    pub freq_step: u32,
    /// Below this temperature the device is considered cool (°C)
    pub min_temp: f64,
    /// Above this temperature the device is considered hot (°C)
    pub max_temp: f64,
    /// How long the device must run hot before cooling it down
    pub dec_time: Duration,
    /// How long the device must run cool before speeding it up
    pub inc_time: Duration,
}

impl DeviceModel {
    pub fn clamp(&self, frequency: u32) -> u32 {
        frequency.clamp(self.min_freq, self.max_freq)
    }
}

/// Telemetry sampled from a device on each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Hottest chain temperature (°C)
    pub temperature: f64,
    /// Time since the frequency last changed.
    ///
    /// Clients fill this with the mining process uptime; the control loop
    /// narrows it with its own record of the last change.
    pub elapsed: Duration,
    /// Frequency the device reports it is running at (MHz)
    pub api_frequency: u32,
    pub hash_rate_avg: HashRate,
    pub hash_rate_5s: HashRate,
    /// Hardware errors as a percentage of work done
    pub hardware_error_rate: f64,
}

/// Mutable runtime state for one device, owned by its controller.
#[derive(Debug)]
pub struct DeviceState {
    host: String,
    current_frequency: Option<u32>,
    frequency_history: Vec<u32>,
    last_change: Option<Instant>,
    jobs: JobGroup,
}

impl DeviceState {
    pub fn new(host: impl Into<String>, jobs: JobGroup) -> Self {
        Self {
            host: host.into(),
            current_frequency: None,
            frequency_history: Vec::new(),
            last_change: None,
            jobs,
        }
    }

    /// Build state with a known history, topmost entry current.
    pub fn with_history(host: impl Into<String>, jobs: JobGroup, history: Vec<u32>) -> Self {
        let mut state = Self::new(host, jobs);
        state.current_frequency = history.last().copied();
        state.frequency_history = history;
        state
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn current_frequency(&self) -> Option<u32> {
        self.current_frequency
    }

    pub fn frequency_history(&self) -> &[u32] {
        &self.frequency_history
    }

    pub fn jobs(&self) -> &JobGroup {
        &self.jobs
    }

    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    /// Reconcile local state with the frequency the device reports.
    ///
    /// The device is authoritative. If it runs at something other than the
    /// top of our history (first tick, restart, a failed write, an operator
    /// change) the history is reseeded from the reported value.
    pub fn observe(&mut self, api_frequency: u32, model: &DeviceModel) {
        let frequency = model.clamp(api_frequency);
        if self.current_frequency != Some(frequency) {
            self.current_frequency = Some(frequency);
            self.frequency_history = vec![frequency];
        }
    }

    /// Time since the last successful change, if one happened.
    pub fn since_last_change(&self, now: Instant) -> Option<Duration> {
        self.last_change.map(|at| now.saturating_duration_since(at))
    }

    /// Telemetry with `elapsed` narrowed to our own record of the last change.
    pub fn effective(&self, mut telemetry: Telemetry, now: Instant) -> Telemetry {
        if let Some(since) = self.since_last_change(now) {
            telemetry.elapsed = telemetry.elapsed.min(since);
        }
        telemetry
    }

    /// One notch below the current frequency.
    ///
    /// This is the history entry beneath the top, or `freq_step` below current
    /// when the history holds nothing older.
    pub fn previous_frequency(&self, model: &DeviceModel) -> u32 {
        match self.frequency_history.as_slice() {
            [.., previous, _] => *previous,
            _ => {
                let current = self.current_frequency.unwrap_or(model.min_freq);
                model.clamp(current.saturating_sub(model.freq_step))
            }
        }
    }

    /// `steps` notches above the current frequency, capped at `max_freq`.
    pub fn next_frequency(&self, model: &DeviceModel, steps: u32) -> u32 {
        let current = self.current_frequency.unwrap_or(model.min_freq);
        model.clamp(current.saturating_add(steps.saturating_mul(model.freq_step)))
    }

    /// Record a decision that has been applied to the device.
    pub fn commit(&mut self, decision: &Decision, now: Instant) {
        match decision.adjustment {
            Adjustment::SpeedUp { .. } => self.frequency_history.push(decision.frequency),
            Adjustment::CoolDown if self.frequency_history.len() > 1 => {
                self.frequency_history.pop();
            }
            Adjustment::CoolDown | Adjustment::Clamp => {
                self.frequency_history.pop();
                self.frequency_history.push(decision.frequency);
            }
        }
        self.current_frequency = Some(decision.frequency);
        self.last_change = Some(now);
    }

    /// Record a frequency forced by a scheduled command.
    pub fn record_forced(&mut self, frequency: u32, model: &DeviceModel, now: Instant) {
        let frequency = model.clamp(frequency);
        self.current_frequency = Some(frequency);
        self.frequency_history = vec![frequency];
        self.last_change = Some(now);
    }
}

/// A device attribute that can be written outside the throttle loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    /// Chip frequency in MHz
    Frequency(u32),
    /// Board voltage code as the firmware expects it, e.g. "0706"
    Voltage(String),
    /// Manual fan control on or off
    FanControl(bool),
    /// Fan duty cycle percentage, only honored with manual fan control
    FanPwm(u8),
    /// Firmware low-voltage mode
    LowVoltage(bool),
}

impl Setting {
    /// Name of the command as written in configuration files.
    pub fn command(&self) -> &'static str {
        match self {
            Setting::Frequency(_) => "frequency",
            Setting::Voltage(_) => "voltage",
            Setting::FanControl(_) => "fan_control",
            Setting::FanPwm(_) => "fan_pwm",
            Setting::LowVoltage(_) => "low_voltage",
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Frequency(mhz) => write!(f, "frequency={mhz}"),
            Setting::Voltage(code) => write!(f, "voltage={code}"),
            Setting::FanControl(on) => write!(f, "fan_control={on}"),
            Setting::FanPwm(pct) => write!(f, "fan_pwm={pct}"),
            Setting::LowVoltage(on) => write!(f, "low_voltage={on}"),
        }
    }
}

/// Errors surfaced by a device client.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("API refused {command}: {message}")]
    Refused { command: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no baseline configuration loaded")]
    NoBaseline,
}

/// Network boundary to a single miner.
///
/// Reads are independent. Writes are staged: `reset_config` loads a baseline,
/// `set` modifies it locally, and `push_config` sends it to the device.
#[async_trait]
pub trait DeviceClient: Send {
    /// Host identity used in logs.
    fn host(&self) -> &str;

    /// Sample current telemetry.
    async fn read_telemetry(&mut self) -> Result<Telemetry, DeviceError>;

    /// Discard staged changes and load the device's configuration as baseline.
    async fn reset_config(&mut self) -> Result<(), DeviceError>;

    /// Stage a change on top of the baseline.
    async fn set(&mut self, setting: &Setting) -> Result<(), DeviceError>;

    /// Write the staged configuration to the device.
    ///
    /// With `apply_immediately` the mining process is restarted so the new
    /// configuration takes effect now rather than at the next restart.
    async fn push_config(&mut self, apply_immediately: bool) -> Result<(), DeviceError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory device client for controller and sequencer tests.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Which write step should fail, if any.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FailAt {
        Reset,
        Set,
        Push,
    }

    /// Everything the fake has been asked to do, shared with the test body.
    #[derive(Debug, Default)]
    pub struct Journal {
        pub calls: Vec<String>,
        pub pushed: Vec<Setting>,
    }

    pub struct FakeClient {
        pub host: String,
        pub telemetry: VecDeque<Result<Telemetry, DeviceError>>,
        pub fail_at: Option<FailAt>,
        pub staged: Vec<Setting>,
        pub journal: Arc<Mutex<Journal>>,
    }

    impl FakeClient {
        pub fn new(host: &str) -> (Self, Arc<Mutex<Journal>>) {
            let journal = Arc::new(Mutex::new(Journal::default()));
            let client = Self {
                host: host.to_string(),
                telemetry: VecDeque::new(),
                fail_at: None,
                staged: Vec::new(),
                journal: journal.clone(),
            };
            (client, journal)
        }

        fn record(&self, call: &str) {
            self.journal.lock().unwrap().calls.push(call.to_string());
        }

        fn maybe_fail(&self, step: FailAt) -> Result<(), DeviceError> {
            if self.fail_at == Some(step) {
                return Err(DeviceError::Refused {
                    command: format!("{step:?}").to_lowercase(),
                    message: "simulated failure".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DeviceClient for FakeClient {
        fn host(&self) -> &str {
            &self.host
        }

        async fn read_telemetry(&mut self) -> Result<Telemetry, DeviceError> {
            self.record("read_telemetry");
            self.telemetry
                .pop_front()
                .unwrap_or_else(|| Err(DeviceError::Timeout(Duration::from_secs(10))))
        }

        async fn reset_config(&mut self) -> Result<(), DeviceError> {
            self.record("reset_config");
            self.maybe_fail(FailAt::Reset)?;
            self.staged.clear();
            Ok(())
        }

        async fn set(&mut self, setting: &Setting) -> Result<(), DeviceError> {
            self.record("set");
            self.maybe_fail(FailAt::Set)?;
            self.staged.push(setting.clone());
            Ok(())
        }

        async fn push_config(&mut self, apply_immediately: bool) -> Result<(), DeviceError> {
            self.record(if apply_immediately { "push_config(apply)" } else { "push_config" });
            self.maybe_fail(FailAt::Push)?;
            self.journal.lock().unwrap().pushed.extend(self.staged.drain(..));
            Ok(())
        }
    }

    pub fn telemetry(temperature: f64, api_frequency: u32, elapsed_secs: u64) -> Telemetry {
        Telemetry {
            temperature,
            elapsed: Duration::from_secs(elapsed_secs),
            api_frequency,
            hash_rate_avg: HashRate::from_terahashes(13.5),
            hash_rate_5s: HashRate::from_terahashes(13.4),
            hardware_error_rate: 0.0012,
        }
    }

    pub fn model() -> DeviceModel {
        DeviceModel {
            min_freq: 500,
            max_freq: 650,
            freq_step: 25,
            min_temp: 72.0,
            max_temp: 76.0,
            dec_time: Duration::from_secs(30),
            inc_time: Duration::from_secs(900),
        }
    }
}
