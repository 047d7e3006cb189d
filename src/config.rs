//! Station configuration.
//!
//! Loaded once at start-up from a YAML, TOML or JSON file, then overridden by
//! environment variables prefixed with `APP_`. Nested keys are underscore
//! delimited: `APP_REMOTE_HOST` sets `remote.host`, `APP_SITE_NAME` sets
//! `site_name`.

use std::{fmt, path::Path, path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    value::{Uncased, UncasedStr},
    Figment,
};
use serde::Deserialize;

use crate::{error::ConfigError, naming::SITE_NAME_LEN};

pub const ENV_PREFIX: &str = "APP_";
/// Config sections an env var may address with its first segment
const SECTIONS: [&str; 2] = ["radio", "remote"];
/// Longest delay or timeout accepted anywhere in the config, seconds
pub const MAX_DELAY: f64 = 86_400.0;

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    pub site_name: String,
    pub capture_dir: PathBuf,
    pub segment_dir: PathBuf,
    /// Seconds of samples per capture
    #[serde(default = "default_record_time")]
    pub record_time: f64,
    /// Minimum peak magnitude in mV
    #[serde(default = "default_trigger_level")]
    pub trigger_level: f64,
    /// Detector idle poll, seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Back-off after an unexpected loop failure, seconds
    #[serde(default = "default_error_backoff")]
    pub error_backoff: f64,
    /// Per-worker join deadline, seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: f64,
    #[serde(default)]
    pub radio: RadioConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RadioConfig {
    /// Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Hz
    #[serde(default = "default_center_freq")]
    pub center_freq: f64,
    /// dB
    #[serde(default)]
    pub gain: f64,
    /// Volts spanned by a full-scale sample
    #[serde(default = "default_adc_voltage_range")]
    pub adc_voltage_range: f64,
    /// Buffers held between acquisition and the writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds the writer blocks on the queue per fetch
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: f64,
}

/// How segment files reach the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// SFTP over SSH to `host:port`
    #[default]
    Sftp,
    /// The collector's share is mounted on the station at `root`
    Mount,
}

#[derive(Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Collector root, files land in `<root>/<site_name>/`
    pub root: PathBuf,
    /// Seconds allowed for the TCP connect and for each blocking SSH call
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Seconds between connect attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    /// Most files uploaded per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between upload cycles
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay: f64,
}

// Keep the password out of logs
impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("transport", &self.transport)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("root", &self.root)
            .field("timeout", &self.timeout)
            .field("connect_attempts", &self.connect_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("batch_size", &self.batch_size)
            .field("cycle_delay", &self.cycle_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            center_freq: default_center_freq(),
            gain: 0.0,
            adc_voltage_range: default_adc_voltage_range(),
            queue_capacity: default_queue_capacity(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

fn default_app_name() -> String {
    "LLTS".to_owned()
}

fn default_record_time() -> f64 {
    1.0
}

fn default_trigger_level() -> f64 {
    100.0
}

fn default_poll_interval() -> f64 {
    5.0
}

fn default_error_backoff() -> f64 {
    1.0
}

fn default_shutdown_timeout() -> f64 {
    5.0
}

fn default_sample_rate() -> f64 {
    2e6
}

fn default_center_freq() -> f64 {
    100e6
}

fn default_adc_voltage_range() -> f64 {
    1.0
}

fn default_queue_capacity() -> usize {
    100
}

fn default_fetch_timeout() -> f64 {
    1.0
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> f64 {
    5.0
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_retry_delay() -> f64 {
    2.0
}

fn default_batch_size() -> usize {
    50
}

fn default_cycle_delay() -> f64 {
    1.0
}

/// Map `SECTION_KEY` onto `section.key`, leave everything else top-level
fn env_key(key: &UncasedStr) -> Uncased<'_> {
    let key = key.as_str().to_ascii_lowercase();
    for section in SECTIONS {
        if let Some(rest) = key
            .strip_prefix(section)
            .and_then(|rest| rest.strip_prefix('_'))
        {
            return Uncased::from(format!("{}.{}", section, rest));
        }
    }
    Uncased::from(key)
}

impl StationConfig {
    /// Load from `path` (`.yaml`/`.yml`, `.toml` or `.json`) and the environment, then validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::figment(path.as_ref())?.extract::<Self>()?.validated()
    }

    pub fn figment(path: &Path) -> Result<Figment, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let figment = match ext.as_deref() {
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            Some("toml") => Figment::new().merge(Toml::file(path)),
            Some("json") => Figment::new().merge(Json::file(path)),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "Unsupported config format: {}",
                    path.display()
                )))
            }
        };
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).map(env_key)))
    }

    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.site_name.len() != SITE_NAME_LEN
            || !self.site_name.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return invalid(format!(
                "site_name '{}' must be exactly {} ASCII letters or digits",
                self.site_name, SITE_NAME_LEN
            ));
        }
        if !(self.record_time > 0.0) {
            return invalid(format!("record_time {} must be positive", self.record_time));
        }
        if !(self.trigger_level >= 0.0) {
            return invalid(format!(
                "trigger_level {} must not be negative",
                self.trigger_level
            ));
        }
        if !(self.radio.adc_voltage_range > 0.0) {
            return invalid(format!(
                "radio.adc_voltage_range {} must be positive",
                self.radio.adc_voltage_range
            ));
        }
        if self.window_len() == 0 {
            return invalid(format!(
                "radio.sample_rate {} is too low for a 1 ms detection window",
                self.radio.sample_rate
            ));
        }
        if self.samples_per_buffer() == 0 {
            return invalid("record_time * sample_rate must be at least one sample".to_owned());
        }
        if self.radio.queue_capacity == 0 {
            return invalid("radio.queue_capacity must be at least 1".to_owned());
        }
        if self.remote.connect_attempts == 0 {
            return invalid("remote.connect_attempts must be at least 1".to_owned());
        }
        if self.remote.transport == TransportKind::Sftp && !(self.remote.timeout > 0.0) {
            return invalid("remote.timeout must be positive for sftp".to_owned());
        }
        if self.remote.batch_size == 0 {
            return invalid("remote.batch_size must be at least 1".to_owned());
        }
        for (name, delay) in [
            ("poll_interval", self.poll_interval),
            ("error_backoff", self.error_backoff),
            ("shutdown_timeout", self.shutdown_timeout),
            ("radio.fetch_timeout", self.radio.fetch_timeout),
            ("remote.retry_delay", self.remote.retry_delay),
            ("remote.cycle_delay", self.remote.cycle_delay),
            ("remote.timeout", self.remote.timeout),
        ] {
            if !(0.0..=MAX_DELAY).contains(&delay) {
                return invalid(format!(
                    "{} {} must be between 0 and {} seconds",
                    name, delay, MAX_DELAY
                ));
            }
        }
        Ok(())
    }

    /// Samples in one detection window (1 ms)
    pub fn window_len(&self) -> usize {
        (self.radio.sample_rate * 0.001).floor() as usize
    }

    pub fn samples_per_buffer(&self) -> usize {
        (self.radio.sample_rate * self.record_time).floor() as usize
    }
}

/// Seconds from config to a [`Duration`], clamped to `0..=MAX_DELAY`
pub fn secs(value: f64) -> Duration {
    if value.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(value.clamp(0.0, MAX_DELAY))
}
