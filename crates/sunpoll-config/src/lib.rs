//! Configuration for the sunpoll daemon and CLI.
//!
//! A TOML file at the platform config dir, overridable through
//! `SUNPOLL_`-prefixed environment variables, credential resolution
//! (env + plaintext + keyring), and translation to
//! `sunpoll_core::CoordinatorConfig`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sunpoll_core::{
    BackoffConfig, CloudSettings, CoordinatorConfig, DeviceConfig, DeviceRole, Intervals,
    LocalLink, TlsMode,
};

const KEYRING_SERVICE: &str = "sunpoll";
const REDACTED: &str = "********";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no cloud password configured for '{username}'")]
    NoCredentials { username: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    /// Cloud portal account, shared by every device with `cloud = true`.
    pub cloud: Option<CloudSection>,

    #[serde(default)]
    pub devices: Vec<DeviceSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    /// Seconds between cloud polls.
    #[serde(default = "default_cloud_interval")]
    pub cloud_interval: u64,

    /// Seconds between polls of direct links.
    #[serde(default = "default_local_interval")]
    pub local_interval: u64,

    /// Seconds before a single read is abandoned.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    #[serde(default)]
    pub backoff: BackoffSection,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            cloud_interval: default_cloud_interval(),
            local_interval: default_local_interval(),
            read_timeout: default_read_timeout(),
            backoff: BackoffSection::default(),
        }
    }
}

fn default_cloud_interval() -> u64 {
    60
}
fn default_local_interval() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffSection {
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            factor: default_backoff_factor(),
            max_secs: default_backoff_max(),
            jitter: default_backoff_jitter(),
        }
    }
}

fn default_backoff_base() -> u64 {
    1
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_max() -> u64 {
    60
}
fn default_backoff_jitter() -> f64 {
    0.1
}

/// The cloud monitoring portal account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudSection {
    /// Portal base URL (e.g., "https://monitor.eg4electronics.com/WManage").
    pub base_url: String,

    pub username: String,

    /// Password (plaintext -- prefer `password_env` or the keyring).
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub insecure: bool,

    /// HTTP timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
}

fn default_http_timeout() -> u64 {
    30
}

/// One device and the links it is reachable over.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSection {
    pub serial: String,

    /// "inverter" or "grid_controller".
    #[serde(default)]
    pub kind: DeviceRole,

    pub name: Option<String>,

    pub model: Option<String>,

    /// Parallel group override.
    pub group: Option<u8>,

    /// Also poll through the cloud account.
    #[serde(default)]
    pub cloud: bool,

    pub modbus_tcp: Option<ModbusTcpSection>,

    pub modbus_serial: Option<ModbusSerialSection>,

    pub dongle: Option<DongleSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModbusTcpSection {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModbusSerialSection {
    pub path: PathBuf,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DongleSection {
    pub host: String,
    #[serde(default = "default_dongle_port")]
    pub port: u16,
    /// Serial of the WiFi dongle itself.
    pub datalogger: String,
}

fn default_modbus_port() -> u16 {
    502
}
fn default_unit_id() -> u8 {
    1
}
fn default_baud_rate() -> u32 {
    19_200
}
fn default_dongle_port() -> u16 {
    8000
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "sunpoll", "sunpoll").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("sunpoll");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the config from `path` plus environment. Nested keys use a
/// double underscore, e.g. `SUNPOLL_DEFAULTS__LOCAL_INTERVAL=5`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SUNPOLL_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Render the config as TOML with plaintext secrets masked.
pub fn render_redacted(cfg: &Config) -> Result<String, ConfigError> {
    let mut shown = cfg.clone();
    if let Some(cloud) = shown.cloud.as_mut() {
        if cloud.password.is_some() {
            cloud.password = Some(REDACTED.into());
        }
    }
    Ok(toml::to_string_pretty(&shown)?)
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the cloud password: the named env var, then the plaintext
/// value, then the system keyring entry `sunpoll / <username>`.
pub fn resolve_cloud_password(cloud: &CloudSection) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = cloud.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Some(ref pw) = cloud.password {
        return Ok(SecretString::from(pw.clone()));
    }

    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &cloud.username) {
        if let Ok(pw) = entry.get_password() {
            return Ok(SecretString::from(pw));
        }
    }

    Err(ConfigError::NoCredentials {
        username: cloud.username.clone(),
    })
}

// ── Translation ─────────────────────────────────────────────────────

/// Validate `cfg` and build the coordinator's runtime config.
pub fn to_coordinator_config(cfg: &Config) -> Result<CoordinatorConfig, ConfigError> {
    let defaults = &cfg.defaults;
    let intervals = Intervals {
        cloud: positive_secs("defaults.cloud_interval", defaults.cloud_interval)?,
        local: positive_secs("defaults.local_interval", defaults.local_interval)?,
    };
    let read_timeout = positive_secs("defaults.read_timeout", defaults.read_timeout)?;
    let backoff = backoff_config(&defaults.backoff)?;

    let cloud = cfg.cloud.as_ref().map(cloud_settings).transpose()?;

    let mut seen = HashSet::new();
    let mut devices = Vec::with_capacity(cfg.devices.len());
    for (i, section) in cfg.devices.iter().enumerate() {
        let device = device_config(i, section)?;
        if !seen.insert(device.serial.clone()) {
            return Err(invalid(
                format!("devices[{i}].serial"),
                format!("duplicate serial {}", device.serial),
            ));
        }
        if device.cloud && cloud.is_none() {
            return Err(invalid(
                format!("devices[{i}].cloud"),
                "cloud polling needs a [cloud] section",
            ));
        }
        devices.push(device);
    }

    Ok(CoordinatorConfig {
        intervals,
        read_timeout,
        backoff,
        cloud,
        devices,
        background: true,
    })
}

fn positive_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(invalid(field, "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}

fn backoff_config(section: &BackoffSection) -> Result<BackoffConfig, ConfigError> {
    if section.factor < 1.0 {
        return Err(invalid("defaults.backoff.factor", "must be at least 1.0"));
    }
    if !(0.0..=1.0).contains(&section.jitter) {
        return Err(invalid("defaults.backoff.jitter", "must be between 0 and 1"));
    }
    Ok(BackoffConfig {
        base: positive_secs("defaults.backoff.base_secs", section.base_secs)?,
        factor: section.factor,
        max_delay: positive_secs("defaults.backoff.max_secs", section.max_secs)?,
        jitter: section.jitter,
    })
}

fn cloud_settings(section: &CloudSection) -> Result<CloudSettings, ConfigError> {
    let base_url: url::Url = section
        .base_url
        .parse()
        .map_err(|_| invalid("cloud.base_url", format!("invalid URL: {}", section.base_url)))?;
    if section.username.trim().is_empty() {
        return Err(invalid("cloud.username", "must not be empty"));
    }
    let password = resolve_cloud_password(section)?;

    let tls = if section.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = section.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    Ok(CloudSettings {
        base_url,
        username: section.username.clone(),
        password,
        tls,
        timeout: positive_secs("cloud.timeout", section.timeout)?,
    })
}

fn device_config(index: usize, section: &DeviceSection) -> Result<DeviceConfig, ConfigError> {
    let field = |name: &str| format!("devices[{index}].{name}");

    let serial = section.serial.trim();
    if serial.is_empty() {
        return Err(invalid(field("serial"), "must not be empty"));
    }

    let mut links = Vec::new();
    if let Some(tcp) = &section.modbus_tcp {
        links.push(LocalLink::ModbusTcp {
            host: tcp.host.clone(),
            port: tcp.port,
            unit_id: tcp.unit_id,
        });
    }
    if let Some(rtu) = &section.modbus_serial {
        links.push(LocalLink::ModbusSerial {
            path: rtu.path.clone(),
            baud_rate: rtu.baud_rate,
            unit_id: rtu.unit_id,
        });
    }
    if let Some(dongle) = &section.dongle {
        if dongle.datalogger.trim().is_empty() {
            return Err(invalid(field("dongle.datalogger"), "must not be empty"));
        }
        links.push(LocalLink::Dongle {
            host: dongle.host.clone(),
            port: dongle.port,
            datalogger: dongle.datalogger.clone(),
        });
    }
    if links.len() > 1 {
        return Err(invalid(
            field("local"),
            "at most one of modbus_tcp, modbus_serial, dongle",
        ));
    }
    let local = links.pop();
    if local.is_none() && !section.cloud {
        return Err(invalid(
            field("local"),
            "needs a local link or cloud = true",
        ));
    }

    Ok(DeviceConfig {
        serial: serial.to_owned(),
        role: section.kind,
        name: section.name.clone(),
        model: section.model.clone(),
        group: section.group,
        local,
        cloud: section.cloud,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_coordinator_defaults() {
        let cfg = to_coordinator_config(&Config::default()).unwrap();
        let expected = CoordinatorConfig::default();
        assert_eq!(cfg.intervals, expected.intervals);
        assert_eq!(cfg.read_timeout, expected.read_timeout);
        assert_eq!(cfg.backoff, expected.backoff);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn zero_interval_names_the_field() {
        let mut cfg = Config::default();
        cfg.defaults.local_interval = 0;
        let err = to_coordinator_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("defaults.local_interval"));
    }

    #[test]
    fn redacted_render_hides_plaintext_password() {
        let cfg = Config {
            cloud: Some(CloudSection {
                base_url: "https://monitor.test/WManage".into(),
                username: "owner".into(),
                password: Some("hunter2".into()),
                password_env: None,
                ca_cert: None,
                insecure: false,
                timeout: 30,
            }),
            ..Config::default()
        };
        let text = render_redacted(&cfg).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains(REDACTED));
    }
}
