//! Antminer device client.
//!
//! Telemetry comes from the cgminer API. Configuration goes through the
//! miner's web interface: `get_miner_conf.cgi` returns the persisted
//! configuration as JSON, `set_miner_conf.cgi` accepts a full replacement as
//! a form post. The form always carries every field, so writes start from a
//! freshly read baseline and change only what was asked.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::cgminer::{self, CgminerApi};
use super::{DeviceClient, DeviceError, Setting, Telemetry};
use crate::config::MinerConfig;
use crate::tracing::prelude::*;

const GET_CONF_PATH: &str = "/cgi-bin/get_miner_conf.cgi";
const SET_CONF_PATH: &str = "/cgi-bin/set_miner_conf.cgi";

/// The web interface accepts this many pools.
const POOL_SLOTS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pool {
    pub url: String,
    pub user: String,
    pub pass: String,
}

/// Persisted miner configuration, as far as the web form exposes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinerConf {
    pub pools: Vec<Pool>,
    pub frequency: String,
    pub voltage: String,
    pub fan_control: bool,
    pub fan_pwm: String,
    pub low_voltage: bool,
    pub no_beeper: bool,
    pub no_temp_over_ctrl: bool,
}

impl MinerConf {
    /// Parse the JSON document served by `get_miner_conf.cgi`.
    ///
    /// Firmware versions disagree on whether flags and numbers are quoted, so
    /// both forms are accepted.
    pub fn from_json(conf: &Value) -> Result<Self, DeviceError> {
        let conf = conf
            .as_object()
            .ok_or_else(|| DeviceError::Malformed("miner conf is not an object".into()))?;

        let pools = conf
            .get("pools")
            .and_then(Value::as_array)
            .map(|pools| {
                pools
                    .iter()
                    .map(|pool| Pool {
                        url: text(pool.get("url")),
                        user: text(pool.get("user")),
                        pass: text(pool.get("pass")),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let frequency = text(conf.get("bitmain-freq"));
        if frequency.is_empty() {
            return Err(DeviceError::Malformed("miner conf has no bitmain-freq".into()));
        }

        Ok(Self {
            pools,
            frequency,
            voltage: text(conf.get("bitmain-voltage")),
            fan_control: flag(conf.get("bitmain-fan-ctrl")),
            fan_pwm: text(conf.get("bitmain-fan-pwm")),
            low_voltage: flag(conf.get("bitmain-use-vil")),
            no_beeper: flag(conf.get("bitmain-nobeeper")),
            no_temp_over_ctrl: flag(conf.get("bitmain-notempoverctrl")),
        })
    }

    pub fn apply(&mut self, setting: &Setting) {
        match setting {
            Setting::Frequency(mhz) => self.frequency = mhz.to_string(),
            Setting::Voltage(code) => self.voltage = code.clone(),
            Setting::FanControl(on) => self.fan_control = *on,
            Setting::FanPwm(pct) => self.fan_pwm = pct.to_string(),
            Setting::LowVoltage(on) => self.low_voltage = *on,
        }
    }

    /// Fields for `set_miner_conf.cgi`.
    pub fn form(&self) -> Vec<(String, String)> {
        let mut form = Vec::with_capacity(POOL_SLOTS * 3 + 7);

        let empty = Pool::default();
        for slot in 0..POOL_SLOTS {
            let pool = self.pools.get(slot).unwrap_or(&empty);
            let n = slot + 1;
            form.push((format!("_ant_pool{n}url"), pool.url.clone()));
            form.push((format!("_ant_pool{n}user"), pool.user.clone()));
            form.push((format!("_ant_pool{n}pw"), pool.pass.clone()));
        }

        let mut field = |name: &str, value: String| form.push((name.to_string(), value));
        field("_ant_nobeeper", self.no_beeper.to_string());
        field("_ant_notempoverctrl", self.no_temp_over_ctrl.to_string());
        field("_ant_fan_customize_switch", self.fan_control.to_string());
        field("_ant_fan_customize_value", self.fan_pwm.clone());
        field("_ant_freq", self.frequency.clone());
        field("_ant_voltage", self.voltage.clone());
        field("_ant_use_vil", self.low_voltage.to_string());

        form
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
        Some(Value::Number(n)) => n.as_u64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// Client for a stock-firmware Antminer.
pub struct AntminerClient {
    host: String,
    api: CgminerApi,
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    staged: Option<MinerConf>,
}

impl std::fmt::Debug for AntminerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntminerClient")
            .field("host", &self.host)
            .field("api", &self.api.addr())
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("staged", &self.staged.is_some())
            .finish()
    }
}

impl AntminerClient {
    pub fn new(miner: &MinerConfig) -> Result<Self, DeviceError> {
        Self::with_timeout(miner, cgminer::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(miner: &MinerConfig, timeout: Duration) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            host: miner.host.clone(),
            api: CgminerApi::new(&miner.host, miner.api_port).with_timeout(timeout),
            http,
            base_url: format!("http://{}:{}", miner.host, miner.http_port),
            username: miner.username.clone(),
            password: miner.password.clone(),
            staged: None,
        })
    }

    async fn fetch_conf(&self) -> Result<MinerConf, DeviceError> {
        let body = self
            .http
            .get(format!("{}{GET_CONF_PATH}", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let conf: Value = serde_json::from_str(&body)
            .map_err(|e| DeviceError::Malformed(format!("miner conf: {e}")))?;
        MinerConf::from_json(&conf)
    }

    async fn store_conf(&self, conf: &MinerConf) -> Result<(), DeviceError> {
        self.http
            .post(format!("{}{SET_CONF_PATH}", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .form(&conf.form())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for AntminerClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn read_telemetry(&mut self) -> Result<Telemetry, DeviceError> {
        self.api.telemetry().await
    }

    async fn reset_config(&mut self) -> Result<(), DeviceError> {
        self.staged = None;
        let conf = self.fetch_conf().await?;
        debug!(host = %self.host, frequency = %conf.frequency, "Loaded baseline configuration");
        self.staged = Some(conf);
        Ok(())
    }

    async fn set(&mut self, setting: &Setting) -> Result<(), DeviceError> {
        let staged = self.staged.as_mut().ok_or(DeviceError::NoBaseline)?;
        staged.apply(setting);
        Ok(())
    }

    async fn push_config(&mut self, apply_immediately: bool) -> Result<(), DeviceError> {
        let staged = self.staged.as_ref().ok_or(DeviceError::NoBaseline)?;
        self.store_conf(staged).await?;
        debug!(host = %self.host, "Configuration stored");

        if apply_immediately {
            self.api.restart().await?;
            debug!(host = %self.host, "Mining process restarted");
        }
        Ok(())
    }
}
