// ── Transport abstraction ──
//
// One trait per capability. `Transport` is what every link can do;
// `ControllerTransport` is only implemented by links able to address a
// grid controller. Callers resolve the capability once, when they build
// the device link, instead of probing per read.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::Error;
use crate::models::{
    FirmwareInfo, RawBatteryBank, RawControllerEnergy, RawControllerRuntime, RawEnergy,
    RawParameters, RawRuntime,
};

/// Wire channel a binding talks over.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Cloud,
    ModbusTcp,
    ModbusSerial,
    Dongle,
}

impl TransportKind {
    /// Local links talk to the device directly (no cloud round-trip).
    pub fn is_local(self) -> bool {
        !matches!(self, Self::Cloud)
    }
}

/// What sits behind a binding.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceRole {
    #[default]
    Inverter,
    GridController,
}

/// A physical endpoint. Two bindings with equal endpoints share one link
/// and must never have overlapping requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// Cloud API base URL; all cloud bindings share it.
    Cloud { base_url: String },
    /// `host:port` of a Modbus TCP gateway or WiFi dongle.
    Tcp { host: String, port: u16 },
    /// Serial device path (RS485 adapter).
    Serial { path: String },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cloud { base_url } => write!(f, "{base_url}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Serial { path } => write!(f, "{path}"),
        }
    }
}

/// A contiguous block of holding registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterRange {
    pub start: u16,
    pub count: u16,
}

impl RegisterRange {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Split into sub-ranges of at most `max` registers each.
    pub fn chunks(self, max: u16) -> Vec<RegisterRange> {
        let max = max.max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        let mut remaining = self.count;
        while remaining > 0 {
            let count = remaining.min(max);
            out.push(RegisterRange { start, count });
            start = start.saturating_add(count);
            remaining -= count;
        }
        out
    }

    /// Exclusive end register.
    pub fn end(self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end())
    }
}

/// A link to one addressed device.
///
/// Implementations keep an internal connected flag. After any error for
/// which [`Error::is_connection_lost`] is true the flag is cleared, and the
/// caller must `connect()` again before retrying. A failed read never
/// touches previously returned data.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn endpoint(&self) -> &Endpoint;

    /// Serial number of the device this link addresses.
    fn serial(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), Error>;

    async fn disconnect(&mut self);

    /// Disconnect and release the physical link, if this transport owns
    /// one. Used on shutdown and reconfigure.
    async fn close(&mut self) {
        self.disconnect().await;
    }

    async fn read_runtime(&mut self) -> Result<RawRuntime, Error>;

    async fn read_energy(&mut self) -> Result<RawEnergy, Error>;

    async fn read_battery(&mut self) -> Result<RawBatteryBank, Error>;

    async fn read_parameters(&mut self, range: RegisterRange) -> Result<RawParameters, Error>;

    async fn read_firmware_version(&mut self) -> Result<FirmwareInfo, Error>;

    async fn write_register(&mut self, register: u16, value: u16) -> Result<(), Error>;

    /// Whether this link can read grid-controller data.
    fn supports_controller(&self) -> bool {
        false
    }

    /// Hand out the controller capability. Only called when
    /// [`supports_controller`](Self::supports_controller) returned `true`.
    fn as_controller(&mut self) -> Option<&mut dyn ControllerTransport> {
        None
    }
}

/// Capability trait for links that can read a grid controller's CT data.
#[async_trait]
pub trait ControllerTransport: Send {
    async fn read_controller_runtime(&mut self) -> Result<RawControllerRuntime, Error>;

    async fn read_controller_energy(&mut self) -> Result<RawControllerEnergy, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_range_chunks_cover_whole_range() {
        let chunks = RegisterRange::new(0, 127).chunks(40);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], RegisterRange::new(0, 40));
        assert_eq!(chunks[3], RegisterRange::new(120, 7));
        let total: u16 = chunks.iter().map(|c| c.count).sum();
        assert_eq!(total, 127);
    }

    #[test]
    fn endpoint_display() {
        let tcp = Endpoint::Tcp {
            host: "10.0.0.5".into(),
            port: 502,
        };
        assert_eq!(tcp.to_string(), "10.0.0.5:502");
        let serial = Endpoint::Serial {
            path: "/dev/ttyUSB0".into(),
        };
        assert_eq!(serial.to_string(), "/dev/ttyUSB0");
    }

    #[test]
    fn transport_kind_parses_snake_case() {
        assert_eq!("modbus_tcp".parse::<TransportKind>().ok(), Some(TransportKind::ModbusTcp));
        assert_eq!(TransportKind::Dongle.to_string(), "dongle");
        assert!(!TransportKind::Cloud.is_local());
    }
}
