// ── Domain model ──
//
// Canonical sensor values and the immutable per-cycle snapshot handed to
// consumers. Everything here is plain data: cheap to clone, serializable,
// and never mutated after publish.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SensorValue {
    /// Numeric view of the value; `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            Self::Integer(v) => Some(*v as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", if *b { "on" } else { "off" }),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:.2}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for SensorValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for SensorValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for SensorValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for SensorValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SensorValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

/// Sensor key → value for one device in one cycle. Ordered for stable output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensors(BTreeMap<String, SensorValue>);

impl Sensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SensorValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Set `key` only when `value` is present.
    pub fn set_opt<V: Into<SensorValue>>(&mut self, key: impl Into<String>, value: Option<V>) {
        if let Some(v) = value {
            self.set(key, v);
        }
    }

    /// Insert `key` with `value` unless it already exists.
    pub fn ensure(&mut self, key: impl Into<String>, value: impl Into<SensorValue>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&SensorValue> {
        self.0.get(key)
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(SensorValue::as_f64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<SensorValue> {
        self.0.remove(key)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &SensorValue) -> bool) {
        self.0.retain(|k, v| keep(k, v));
    }

    pub fn extend(&mut self, other: Sensors) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SensorValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, SensorValue)> for Sensors {
    fn from_iter<I: IntoIterator<Item = (String, SensorValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a snapshot entry represents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Inverter,
    GridController,
    /// Computed from members, never read from a transport.
    ParallelGroup,
}

impl From<sunpoll_api::DeviceRole> for DeviceKind {
    fn from(role: sunpoll_api::DeviceRole) -> Self {
        match role {
            sunpoll_api::DeviceRole::Inverter => Self::Inverter,
            sunpoll_api::DeviceRole::GridController => Self::GridController,
        }
    }
}

/// One device's published state for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub serial: String,
    pub kind: DeviceKind,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub available: bool,
    pub sensors: Sensors,
    /// Per-module battery sensors keyed `battery_1`, `battery_2`, ...
    pub batteries: BTreeMap<String, Sensors>,
    /// Serial of the parallel group this device belongs to.
    pub parent_group: Option<String>,
}

/// Decoded holding-register settings for one device.
pub type Parameters = BTreeMap<String, SensorValue>;

/// The complete immutable result of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Bumped on every publish; 0 means nothing has been published yet.
    pub version: u64,
    pub taken_at: Option<DateTime<Utc>>,
    pub devices: BTreeMap<String, Arc<DeviceSnapshot>>,
    pub parameters: BTreeMap<String, Parameters>,
}

impl Snapshot {
    pub fn device(&self, serial: &str) -> Option<&Arc<DeviceSnapshot>> {
        self.devices.get(serial)
    }
}

/// Identity metadata for presenting a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub name: String,
    pub manufacturer: String,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub kind: DeviceKind,
    pub parent_group: Option<String>,
}
