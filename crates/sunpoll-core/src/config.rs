// ── Runtime coordinator configuration ──
//
// These types describe *what* to poll and *how often*. They carry
// credentials and link addresses but never touch disk: sunpoll-config (or a
// test) builds a `CoordinatorConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use sunpoll_api::{DeviceRole, TlsMode};
use url::Url;

use crate::backoff::BackoffConfig;

pub const DEFAULT_CLOUD_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCAL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval per transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub cloud: Duration,
    pub local: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            cloud: DEFAULT_CLOUD_INTERVAL,
            local: DEFAULT_LOCAL_INTERVAL,
        }
    }
}

impl Intervals {
    /// The cadence the background cycle runs at: the faster family.
    pub fn tick(&self) -> Duration {
        self.cloud.min(self.local)
    }
}

/// Cloud portal account shared by every cloud binding.
#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub base_url: Url,
    pub username: String,
    pub password: SecretString,
    pub tls: TlsMode,
    pub timeout: Duration,
}

/// One direct link to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalLink {
    ModbusTcp {
        host: String,
        port: u16,
        unit_id: u8,
    },
    ModbusSerial {
        path: PathBuf,
        baud_rate: u32,
        unit_id: u8,
    },
    /// WiFi dongle relaying register reads for the inverter serial.
    Dongle {
        host: String,
        port: u16,
        datalogger: String,
    },
}

/// A device declared by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub serial: String,
    pub role: DeviceRole,
    /// Display name; defaults to the serial.
    pub name: Option<String>,
    pub model: Option<String>,
    /// Parallel-group override. When unset the inverter's own parallel
    /// register decides.
    pub group: Option<u8>,
    pub local: Option<LocalLink>,
    /// Also poll through the cloud account.
    pub cloud: bool,
}

impl DeviceConfig {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            role: DeviceRole::Inverter,
            name: None,
            model: None,
            group: None,
            local: None,
            cloud: false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial)
    }
}

/// Everything the coordinator needs to run.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub intervals: Intervals,
    /// Per-read bound applied around every transport call.
    pub read_timeout: Duration,
    pub backoff: BackoffConfig,
    pub cloud: Option<CloudSettings>,
    pub devices: Vec<DeviceConfig>,
    /// Run the background poll loop. `oneshot` turns this off.
    pub background: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            intervals: Intervals::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            backoff: BackoffConfig::default(),
            cloud: None,
            devices: Vec::new(),
            background: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn device(&self, serial: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.serial == serial)
    }
}
