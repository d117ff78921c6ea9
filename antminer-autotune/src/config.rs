//! YAML configuration.
//!
//! ```yaml
//! defaults:
//!   min_temp: 72
//!   max_temp: 76
//!   refresh_time: 5
//! miners:
//!   - host: 10.0.0.21
//!     max_freq: 625
//!     schedule:
//!       - command: fan_pwm
//!         value: 100
//!         hour: 12
//!       - command: fan_pwm
//!         value: 70
//!         hour: 20
//! ```
//!
//! Both sections are required. Values under `defaults` override the built-in
//! defaults, and per-miner values override `defaults`. Everything is
//! validated here, so a loaded [`Config`] never holds an unknown command or an
//! unparsable cron expression.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::Value;

use crate::device::cgminer;
use crate::device::{DeviceModel, Setting};
use crate::trigger::cron::{self, CronError, CronSpec, CronTrigger};

pub const DEFAULT_CONFIG_FILENAME: &str = "config.yml";

pub const DEFAULT_MIN_TEMP: f64 = 72.0;
pub const DEFAULT_MAX_TEMP: f64 = 76.0;
pub const DEFAULT_DEC_TIME: u64 = 30;
pub const DEFAULT_INC_TIME: u64 = 900;
pub const DEFAULT_REFRESH_TIME: f64 = 5.0;
pub const DEFAULT_MIN_FREQ: u32 = 400;
pub const DEFAULT_MAX_FREQ: u32 = 650;
pub const DEFAULT_FREQ_STEP: u32 = 25;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_USERNAME: &str = "root";
pub const DEFAULT_PASSWORD: &str = "root";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file '{0}' was not found")]
    NotFound(PathBuf),

    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config did not contain section '{0}'")]
    MissingSection(&'static str),

    #[error("{miner}: {reason}")]
    Invalid { miner: String, reason: String },

    #[error("{miner}: unknown command '{command}'")]
    UnknownCommand { miner: String, command: String },

    #[error("{miner}: invalid value {value} for '{command}'")]
    InvalidValue {
        miner: String,
        command: String,
        value: String,
    },

    #[error("{miner}: {source}")]
    Cron {
        miner: String,
        #[source]
        source: CronError,
    },
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between throttle ticks
    pub refresh_time: Duration,
    pub miners: Vec<MinerConfig>,
}

/// One miner and everything needed to drive it.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub host: String,
    pub api_port: u16,
    pub http_port: u16,
    pub username: String,
    pub password: String,
    pub model: DeviceModel,
    pub schedule: Vec<ScheduleEntry>,
}

/// A setting applied on a calendar schedule.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub setting: Setting,
    pub trigger: CronTrigger,
}

/// Model tunables; shared by `defaults` and per-miner overrides.
#[derive(Debug, Clone, Default)]
struct Tunables {
    min_temp: Option<f64>,
    max_temp: Option<f64>,
    dec_time: Option<u64>,
    inc_time: Option<u64>,
    min_freq: Option<u32>,
    max_freq: Option<u32>,
    freq_step: Option<u32>,
}

impl Tunables {
    fn or(self, fallback: &Tunables) -> Tunables {
        Tunables {
            min_temp: self.min_temp.or(fallback.min_temp),
            max_temp: self.max_temp.or(fallback.max_temp),
            dec_time: self.dec_time.or(fallback.dec_time),
            inc_time: self.inc_time.or(fallback.inc_time),
            min_freq: self.min_freq.or(fallback.min_freq),
            max_freq: self.max_freq.or(fallback.max_freq),
            freq_step: self.freq_step.or(fallback.freq_step),
        }
    }

    fn model(&self) -> DeviceModel {
        DeviceModel {
            min_freq: self.min_freq.unwrap_or(DEFAULT_MIN_FREQ),
            max_freq: self.max_freq.unwrap_or(DEFAULT_MAX_FREQ),
            freq_step: self.freq_step.unwrap_or(DEFAULT_FREQ_STEP),
            min_temp: self.min_temp.unwrap_or(DEFAULT_MIN_TEMP),
            max_temp: self.max_temp.unwrap_or(DEFAULT_MAX_TEMP),
            dec_time: Duration::from_secs(self.dec_time.unwrap_or(DEFAULT_DEC_TIME)),
            inc_time: Duration::from_secs(self.inc_time.unwrap_or(DEFAULT_INC_TIME)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    refresh_time: Option<f64>,
    min_temp: Option<f64>,
    max_temp: Option<f64>,
    dec_time: Option<u64>,
    inc_time: Option<u64>,
    min_freq: Option<u32>,
    max_freq: Option<u32>,
    freq_step: Option<u32>,
}

impl RawDefaults {
    fn tunables(&self) -> Tunables {
        Tunables {
            min_temp: self.min_temp,
            max_temp: self.max_temp,
            dec_time: self.dec_time,
            inc_time: self.inc_time,
            min_freq: self.min_freq,
            max_freq: self.max_freq,
            freq_step: self.freq_step,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMiner {
    host: String,
    api_port: Option<u16>,
    http_port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    #[serde(default)]
    schedule: Vec<RawScheduleEntry>,
    min_temp: Option<f64>,
    max_temp: Option<f64>,
    dec_time: Option<u64>,
    inc_time: Option<u64>,
    min_freq: Option<u32>,
    max_freq: Option<u32>,
    freq_step: Option<u32>,
}

/// Cron fields stay loosely typed: YAML writers use both `hour: 3` and
/// `hour: "*/2"`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScheduleEntry {
    command: String,
    value: Value,
    year: Option<Value>,
    month: Option<Value>,
    day: Option<Value>,
    week: Option<Value>,
    day_of_week: Option<Value>,
    hour: Option<Value>,
    minute: Option<Value>,
    second: Option<Value>,
    start_date: Option<Value>,
    end_date: Option<Value>,
}

impl Config {
    /// Load and validate the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let document: Value = serde_yaml::from_str(data)?;

        let defaults = document
            .get("defaults")
            .ok_or(ConfigError::MissingSection("defaults"))?;
        let miners = document
            .get("miners")
            .ok_or(ConfigError::MissingSection("miners"))?;

        // An empty `defaults:` key parses as null
        let defaults: RawDefaults = if defaults.is_null() {
            RawDefaults::default()
        } else {
            serde_yaml::from_value(defaults.clone())?
        };
        let miners: Vec<RawMiner> = if miners.is_null() {
            Vec::new()
        } else {
            serde_yaml::from_value(miners.clone())?
        };

        let refresh_secs = defaults.refresh_time.unwrap_or(DEFAULT_REFRESH_TIME);
        let refresh_time = Duration::try_from_secs_f64(refresh_secs)
            .ok()
            .filter(|refresh| !refresh.is_zero())
            .ok_or_else(|| ConfigError::Invalid {
                miner: "defaults".into(),
                reason: format!("refresh_time must be positive, got {refresh_secs}"),
            })?;

        let tunables = defaults.tunables();
        let miners = miners
            .into_iter()
            .map(|miner| miner.resolve(&tunables))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            refresh_time,
            miners,
        })
    }
}

impl RawMiner {
    fn resolve(self, defaults: &Tunables) -> Result<MinerConfig, ConfigError> {
        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::Invalid {
                miner: "miners".into(),
                reason: "entry has an empty host".into(),
            });
        }

        let overrides = Tunables {
            min_temp: self.min_temp,
            max_temp: self.max_temp,
            dec_time: self.dec_time,
            inc_time: self.inc_time,
            min_freq: self.min_freq,
            max_freq: self.max_freq,
            freq_step: self.freq_step,
        };
        let model = overrides.or(defaults).model();
        validate_model(&host, &model)?;

        let schedule = self
            .schedule
            .into_iter()
            .map(|entry| entry.resolve(&host))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MinerConfig {
            api_port: self.api_port.unwrap_or(cgminer::DEFAULT_PORT),
            http_port: self.http_port.unwrap_or(DEFAULT_HTTP_PORT),
            username: self.username.unwrap_or_else(|| DEFAULT_USERNAME.into()),
            password: self.password.unwrap_or_else(|| DEFAULT_PASSWORD.into()),
            host,
            model,
            schedule,
        })
    }
}

fn validate_model(host: &str, model: &DeviceModel) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        miner: host.to_string(),
        reason,
    };

    if model.min_freq == 0 || model.min_freq > model.max_freq {
        return Err(invalid(format!(
            "frequency range {}..{} is empty",
            model.min_freq, model.max_freq
        )));
    }
    if model.freq_step == 0 {
        return Err(invalid("freq_step must be positive".into()));
    }
    if model.min_temp >= model.max_temp {
        return Err(invalid(format!(
            "min_temp {} must be below max_temp {}",
            model.min_temp, model.max_temp
        )));
    }
    Ok(())
}

impl RawScheduleEntry {
    fn resolve(self, host: &str) -> Result<ScheduleEntry, ConfigError> {
        let setting = parse_setting(&self.command, &self.value).map_err(|e| match e {
            SettingError::UnknownCommand => ConfigError::UnknownCommand {
                miner: host.to_string(),
                command: self.command.clone(),
            },
            SettingError::InvalidValue => ConfigError::InvalidValue {
                miner: host.to_string(),
                command: self.command.clone(),
                value: describe(&self.value),
            },
        })?;

        let cron_error = |source: CronError| ConfigError::Cron {
            miner: host.to_string(),
            source,
        };
        let date = |value: Option<Value>| {
            value
                .as_ref()
                .map(|value| cron::parse_date(&scalar(value)))
                .transpose()
                .map_err(cron_error)
        };

        let spec = CronSpec {
            year: self.year.as_ref().map(scalar),
            month: self.month.as_ref().map(scalar),
            day: self.day.as_ref().map(scalar),
            week: self.week.as_ref().map(scalar),
            day_of_week: self.day_of_week.as_ref().map(scalar),
            hour: self.hour.as_ref().map(scalar),
            minute: self.minute.as_ref().map(scalar),
            second: self.second.as_ref().map(scalar),
            start_date: date(self.start_date)?,
            end_date: date(self.end_date)?,
        };
        let trigger = CronTrigger::new(&spec).map_err(cron_error)?;

        Ok(ScheduleEntry { setting, trigger })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingError {
    UnknownCommand,
    InvalidValue,
}

/// Turn a `(command, value)` pair into a typed setting.
fn parse_setting(command: &str, value: &Value) -> Result<Setting, SettingError> {
    let setting = match command {
        "frequency" => Setting::Frequency(
            unsigned(value)
                .filter(|mhz| *mhz > 0)
                .and_then(|mhz| u32::try_from(mhz).ok())
                .ok_or(SettingError::InvalidValue)?,
        ),
        // An unquoted code can arrive as an integer and lose its leading zero
        "voltage" => Setting::Voltage(match value {
            Value::String(code) if !code.trim().is_empty() => code.trim().to_string(),
            Value::Number(n) => n
                .as_u64()
                .map(|code| format!("{code:04}"))
                .ok_or(SettingError::InvalidValue)?,
            _ => return Err(SettingError::InvalidValue),
        }),
        "fan_control" => Setting::FanControl(boolean(value).ok_or(SettingError::InvalidValue)?),
        "fan_pwm" => Setting::FanPwm(
            unsigned(value)
                .filter(|pct| *pct <= 100)
                .map(|pct| pct as u8)
                .ok_or(SettingError::InvalidValue)?,
        ),
        "low_voltage" => Setting::LowVoltage(boolean(value).ok_or(SettingError::InvalidValue)?),
        _ => return Err(SettingError::UnknownCommand),
    };
    Ok(setting)
}

fn unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().filter(|n| *n <= 1).map(|n| n == 1),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Some(true),
            "false" | "off" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Render a scalar as the text a cron field or date parser expects.
fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => describe(other),
    }
}

fn describe(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| format!("{value:?}"))
}

#[cfg(test)]
impl MinerConfig {
    /// Miner with every optional field at its default.
    pub(crate) fn for_host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            api_port: cgminer::DEFAULT_PORT,
            http_port: DEFAULT_HTTP_PORT,
            username: DEFAULT_USERNAME.into(),
            password: DEFAULT_PASSWORD.into(),
            model: Tunables::default().model(),
            schedule: Vec::new(),
        }
    }
}
