// ── Raw wire-level models ──
//
// Unscaled values exactly as the device (or cloud) reports them. Voltages,
// frequencies and energies are fixed-point integers; `sunpoll-core` owns
// the scaling table. Fields a given link cannot provide are `None`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Inverter runtime block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRuntime {
    /// Operating state code.
    pub status: u16,
    /// PV string voltages, 0.1 V.
    pub vpv: [Option<u16>; 3],
    /// PV string powers, W.
    pub ppv: [Option<u16>; 3],
    /// Battery voltage, 0.1 V.
    pub vbat: Option<u16>,
    /// State of charge, %.
    pub soc: Option<u8>,
    /// State of health, %.
    pub soh: Option<u8>,
    /// Battery charge power, W.
    pub p_charge: Option<u16>,
    /// Battery discharge power, W.
    pub p_discharge: Option<u16>,
    /// Grid voltage (R phase / L1-L2), 0.1 V.
    pub vac: Option<u16>,
    /// Grid frequency, 0.01 Hz.
    pub fac: Option<u16>,
    /// Inverter output power, W.
    pub p_inv: Option<u16>,
    /// Rectifier (AC charge) power, W.
    pub p_rec: Option<u16>,
    /// EPS / backup output power, W.
    pub p_eps: Option<u16>,
    /// EPS voltage, 0.1 V.
    pub v_eps: Option<u16>,
    /// Power exported to grid, W.
    pub p_to_grid: Option<u16>,
    /// Power imported from grid, W.
    pub p_to_user: Option<u16>,
    /// Bus voltages, 0.1 V.
    pub vbus: [Option<u16>; 2],
    /// Internal temperature, °C.
    pub t_inner: Option<i16>,
    /// Radiator temperatures, °C.
    pub t_radiator: [Option<i16>; 2],
    /// Battery temperature, °C.
    pub t_bat: Option<i16>,
    /// Parallel group number as reported by the device (0 = standalone).
    pub parallel_group: Option<u8>,
    /// Parallel role (0 standalone, 1 primary, 2 secondary).
    pub parallel_role: Option<u8>,
}

/// Inverter energy counters, 0.1 kWh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnergy {
    pub pv_today: [Option<u16>; 3],
    pub inverter_today: Option<u16>,
    pub ac_charge_today: Option<u16>,
    pub charge_today: Option<u16>,
    pub discharge_today: Option<u16>,
    pub eps_today: Option<u16>,
    pub export_today: Option<u16>,
    pub import_today: Option<u16>,

    pub pv_total: [Option<u32>; 3],
    pub inverter_total: Option<u32>,
    pub ac_charge_total: Option<u32>,
    pub charge_total: Option<u32>,
    pub discharge_total: Option<u32>,
    pub eps_total: Option<u32>,
    pub export_total: Option<u32>,
    pub import_total: Option<u32>,
}

/// One battery module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBattery {
    pub index: u8,
    pub serial: Option<String>,
    /// 0.01 V.
    pub voltage: Option<u16>,
    /// 0.01 A, positive = charging.
    pub current: Option<i16>,
    pub soc: Option<u8>,
    pub soh: Option<u8>,
    pub cycle_count: Option<u16>,
    /// 0.1 °C.
    pub max_cell_temp: Option<i16>,
    /// 0.1 °C.
    pub min_cell_temp: Option<i16>,
    /// mV.
    pub max_cell_voltage: Option<u16>,
    /// mV.
    pub min_cell_voltage: Option<u16>,
}

/// Battery bank summary plus its modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBatteryBank {
    pub module_count: Option<u16>,
    /// Ah.
    pub capacity_ah: Option<u16>,
    /// 0.01 A, positive = charging.
    pub current: Option<i16>,
    /// 0.1 A.
    pub charge_current_limit: Option<u16>,
    /// 0.1 A.
    pub discharge_current_limit: Option<u16>,
    /// 0.1 V.
    pub charge_voltage_ref: Option<u16>,
    /// 0.1 V.
    pub discharge_cutoff_voltage: Option<u16>,
    /// mV.
    pub max_cell_voltage: Option<u16>,
    /// mV.
    pub min_cell_voltage: Option<u16>,
    /// 0.1 °C.
    pub max_cell_temp: Option<i16>,
    /// 0.1 °C.
    pub min_cell_temp: Option<i16>,
    pub cycle_count: Option<u16>,
    pub modules: Vec<RawBattery>,
}

/// Holding-register values keyed by register address.
pub type RawParameters = BTreeMap<u16, u16>;

/// Firmware identification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Firmware family code, e.g. `"FAAB"`.
    pub code: String,
    /// Primary controller firmware revision.
    pub primary: u8,
    /// Secondary controller firmware revision.
    pub secondary: u8,
    /// Device type code from the identification block.
    pub device_type: Option<u16>,
    /// Model name when the link reports one (cloud only).
    pub model: Option<String>,
}

impl FirmwareInfo {
    /// Version string as shown on the device, e.g. `"FAAB-2525"`.
    pub fn version(&self) -> String {
        format!("{}-{:02X}{:02X}", self.code, self.primary, self.secondary)
    }
}

/// Grid controller CT runtime. L1/L2 split-phase pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawControllerRuntime {
    /// 0.1 V.
    pub grid_voltage: [Option<u16>; 2],
    /// 0.1 V.
    pub ups_voltage: [Option<u16>; 2],
    /// 0.01 A.
    pub grid_current: [Option<u16>; 2],
    /// 0.01 A.
    pub load_current: [Option<u16>; 2],
    /// W, positive = import.
    pub grid_power: [Option<i16>; 2],
    /// W.
    pub ups_power: [Option<i16>; 2],
    /// W.
    pub load_power: [Option<i16>; 2],
    /// W.
    pub generator_power: [Option<i16>; 2],
    /// Smart-load power per port, L1/L2, W.
    pub smart_load_power: [[Option<i16>; 2]; 4],
    /// AC-couple power per port, L1/L2, W.
    pub ac_couple_power: [[Option<i16>; 2]; 4],
    /// Smart port mode per port (0 unused, 1 smart load, 2 AC couple).
    pub smart_port_status: [Option<u16>; 4],
    /// 0.01 Hz.
    pub grid_frequency: Option<u16>,
}

/// Grid controller energy counters, 0.1 kWh, L1/L2.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawControllerEnergy {
    pub import_today: [Option<u16>; 2],
    pub export_today: [Option<u16>; 2],
    pub load_today: [Option<u16>; 2],
    pub ups_today: [Option<u16>; 2],
    pub import_total: [Option<u32>; 2],
    pub export_total: [Option<u32>; 2],
    pub load_total: [Option<u32>; 2],
    pub ups_total: [Option<u32>; 2],
    pub smart_load_today: [[Option<u16>; 2]; 4],
    pub ac_couple_today: [[Option<u16>; 2]; 4],
}
