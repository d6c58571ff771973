// Cloud API response models
//
// The portal reports the same fixed-point integers the registers carry, so
// conversion into the raw structs is field-for-field. Every field is
// optional: older firmware and smaller models omit whole groups.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;
use crate::models::{
    FirmwareInfo, RawBattery, RawBatteryBank, RawControllerEnergy, RawControllerRuntime,
    RawEnergy, RawParameters, RawRuntime,
};

/// `{ success, msg }` wrapper shared by every endpoint.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default)]
    pub msg: Option<String>,
}

// ── Inverter runtime ───────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRuntime {
    pub status: Option<u16>,
    pub vpv1: Option<u16>,
    pub vpv2: Option<u16>,
    pub vpv3: Option<u16>,
    pub ppv1: Option<u16>,
    pub ppv2: Option<u16>,
    pub ppv3: Option<u16>,
    pub v_bat: Option<u16>,
    pub soc: Option<u8>,
    pub soh: Option<u8>,
    pub p_charge: Option<u16>,
    #[serde(rename = "pDisCharge")]
    pub p_discharge: Option<u16>,
    pub vacr: Option<u16>,
    pub fac: Option<u16>,
    pub pinv: Option<u16>,
    pub prec: Option<u16>,
    pub peps: Option<u16>,
    pub vepsr: Option<u16>,
    pub p_to_grid: Option<u16>,
    pub p_to_user: Option<u16>,
    pub v_bus1: Option<u16>,
    pub v_bus2: Option<u16>,
    pub tinner: Option<i16>,
    pub tradiator1: Option<i16>,
    pub tradiator2: Option<i16>,
    pub t_bat: Option<i16>,
    pub parallel_group: Option<u8>,
    pub parallel_role: Option<u8>,
}

impl From<CloudRuntime> for RawRuntime {
    fn from(c: CloudRuntime) -> Self {
        Self {
            status: c.status.unwrap_or_default(),
            vpv: [c.vpv1, c.vpv2, c.vpv3],
            ppv: [c.ppv1, c.ppv2, c.ppv3],
            vbat: c.v_bat,
            soc: c.soc,
            soh: c.soh,
            p_charge: c.p_charge,
            p_discharge: c.p_discharge,
            vac: c.vacr,
            fac: c.fac,
            p_inv: c.pinv,
            p_rec: c.prec,
            p_eps: c.peps,
            v_eps: c.vepsr,
            p_to_grid: c.p_to_grid,
            p_to_user: c.p_to_user,
            vbus: [c.v_bus1, c.v_bus2],
            t_inner: c.tinner,
            t_radiator: [c.tradiator1, c.tradiator2],
            t_bat: c.t_bat,
            parallel_group: c.parallel_group,
            parallel_role: c.parallel_role,
        }
    }
}

// ── Inverter energy ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudEnergy {
    pub e_pv1_day: Option<u16>,
    pub e_pv2_day: Option<u16>,
    pub e_pv3_day: Option<u16>,
    pub e_inv_day: Option<u16>,
    pub e_rec_day: Option<u16>,
    pub e_chg_day: Option<u16>,
    #[serde(rename = "eDisChgDay")]
    pub e_dischg_day: Option<u16>,
    pub e_eps_day: Option<u16>,
    pub e_to_grid_day: Option<u16>,
    pub e_to_user_day: Option<u16>,
    pub e_pv1_all: Option<u32>,
    pub e_pv2_all: Option<u32>,
    pub e_pv3_all: Option<u32>,
    pub e_inv_all: Option<u32>,
    pub e_rec_all: Option<u32>,
    pub e_chg_all: Option<u32>,
    #[serde(rename = "eDisChgAll")]
    pub e_dischg_all: Option<u32>,
    pub e_eps_all: Option<u32>,
    pub e_to_grid_all: Option<u32>,
    pub e_to_user_all: Option<u32>,
}

impl From<CloudEnergy> for RawEnergy {
    fn from(c: CloudEnergy) -> Self {
        Self {
            pv_today: [c.e_pv1_day, c.e_pv2_day, c.e_pv3_day],
            inverter_today: c.e_inv_day,
            ac_charge_today: c.e_rec_day,
            charge_today: c.e_chg_day,
            discharge_today: c.e_dischg_day,
            eps_today: c.e_eps_day,
            export_today: c.e_to_grid_day,
            import_today: c.e_to_user_day,
            pv_total: [c.e_pv1_all, c.e_pv2_all, c.e_pv3_all],
            inverter_total: c.e_inv_all,
            ac_charge_total: c.e_rec_all,
            charge_total: c.e_chg_all,
            discharge_total: c.e_dischg_all,
            eps_total: c.e_eps_all,
            export_total: c.e_to_grid_all,
            import_total: c.e_to_user_all,
        }
    }
}

// ── Battery ────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudBatteryModule {
    pub battery_index: Option<u8>,
    pub battery_sn: Option<String>,
    pub total_voltage: Option<u16>,
    pub current: Option<i16>,
    pub soc: Option<u8>,
    pub soh: Option<u8>,
    pub cycle_cnt: Option<u16>,
    pub bat_max_cell_temp: Option<i16>,
    pub bat_min_cell_temp: Option<i16>,
    pub bat_max_cell_voltage: Option<u16>,
    pub bat_min_cell_voltage: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudBatteryInfo {
    pub total_number: Option<u16>,
    pub capacity_ah: Option<u16>,
    pub current: Option<i16>,
    pub max_chg_curr: Option<u16>,
    pub max_dischg_curr: Option<u16>,
    pub charge_volt_ref: Option<u16>,
    pub dischg_cut_volt: Option<u16>,
    pub max_cell_voltage: Option<u16>,
    pub min_cell_voltage: Option<u16>,
    pub max_cell_temp: Option<i16>,
    pub min_cell_temp: Option<i16>,
    pub cycle_count: Option<u16>,
    #[serde(default)]
    pub battery_array: Vec<CloudBatteryModule>,
}

impl From<CloudBatteryInfo> for RawBatteryBank {
    fn from(c: CloudBatteryInfo) -> Self {
        let modules = c
            .battery_array
            .into_iter()
            .enumerate()
            .map(|(i, m)| RawBattery {
                index: m
                    .battery_index
                    .unwrap_or_else(|| u8::try_from(i).unwrap_or(u8::MAX)),
                serial: m.battery_sn.filter(|s| !s.is_empty()),
                voltage: m.total_voltage,
                current: m.current,
                soc: m.soc,
                soh: m.soh,
                cycle_count: m.cycle_cnt,
                max_cell_temp: m.bat_max_cell_temp,
                min_cell_temp: m.bat_min_cell_temp,
                max_cell_voltage: m.bat_max_cell_voltage,
                min_cell_voltage: m.bat_min_cell_voltage,
            })
            .collect::<Vec<_>>();
        let module_count = c
            .total_number
            .or_else(|| u16::try_from(modules.len()).ok());

        Self {
            module_count,
            capacity_ah: c.capacity_ah,
            current: c.current,
            charge_current_limit: c.max_chg_curr,
            discharge_current_limit: c.max_dischg_curr,
            charge_voltage_ref: c.charge_volt_ref,
            discharge_cutoff_voltage: c.dischg_cut_volt,
            max_cell_voltage: c.max_cell_voltage,
            min_cell_voltage: c.min_cell_voltage,
            max_cell_temp: c.max_cell_temp,
            min_cell_temp: c.min_cell_temp,
            cycle_count: c.cycle_count,
            modules,
        }
    }
}

// ── Grid controller (midbox) ───────────────────────────────────────

/// `midboxData` is a flat bag of per-leg, per-port fields; it is kept as a
/// map and read by name.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMidbox {
    #[serde(default)]
    pub midbox_data: BTreeMap<String, Value>,
}

impl CloudMidbox {
    fn u16(&self, key: &str) -> Option<u16> {
        self.midbox_data
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }

    fn i16(&self, key: &str) -> Option<i16> {
        self.midbox_data
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|v| i16::try_from(v).ok())
    }

    fn u32(&self, key: &str) -> Option<u32> {
        self.midbox_data
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    fn legs_u16(&self, stem: &str, suffix: &str) -> [Option<u16>; 2] {
        [
            self.u16(&format!("{stem}L1{suffix}")),
            self.u16(&format!("{stem}L2{suffix}")),
        ]
    }

    fn legs_i16(&self, stem: &str, suffix: &str) -> [Option<i16>; 2] {
        [
            self.i16(&format!("{stem}L1{suffix}")),
            self.i16(&format!("{stem}L2{suffix}")),
        ]
    }

    fn legs_u32(&self, stem: &str, suffix: &str) -> [Option<u32>; 2] {
        [
            self.u32(&format!("{stem}L1{suffix}")),
            self.u32(&format!("{stem}L2{suffix}")),
        ]
    }

    pub fn runtime(&self) -> RawControllerRuntime {
        let mut smart_load_power = [[None; 2]; 4];
        let mut ac_couple_power = [[None; 2]; 4];
        let mut smart_port_status = [None; 4];
        for (i, port) in (1..=4).enumerate() {
            smart_load_power[i] = self.legs_i16(&format!("smartLoad{port}"), "ActivePower");
            ac_couple_power[i] = self.legs_i16(&format!("acCouple{port}"), "ActivePower");
            smart_port_status[i] = self.u16(&format!("smartPort{port}Status"));
        }
        RawControllerRuntime {
            grid_voltage: self.legs_u16("grid", "RmsVolt"),
            ups_voltage: self.legs_u16("ups", "RmsVolt"),
            grid_current: self.legs_u16("grid", "RmsCurr"),
            load_current: self.legs_u16("load", "RmsCurr"),
            grid_power: self.legs_i16("grid", "ActivePower"),
            ups_power: self.legs_i16("ups", "ActivePower"),
            load_power: self.legs_i16("load", "ActivePower"),
            generator_power: self.legs_i16("gen", "ActivePower"),
            smart_load_power,
            ac_couple_power,
            smart_port_status,
            grid_frequency: self.u16("gridFreq"),
        }
    }

    pub fn energy(&self) -> RawControllerEnergy {
        let mut smart_load_today = [[None; 2]; 4];
        let mut ac_couple_today = [[None; 2]; 4];
        for (i, port) in (1..=4).enumerate() {
            smart_load_today[i] = self.legs_u16(&format!("eSmartLoad{port}"), "Day");
            ac_couple_today[i] = self.legs_u16(&format!("eACcouple{port}"), "Day");
        }
        RawControllerEnergy {
            import_today: self.legs_u16("eToUser", "Day"),
            export_today: self.legs_u16("eToGrid", "Day"),
            load_today: self.legs_u16("eLoad", "Day"),
            ups_today: self.legs_u16("eUps", "Day"),
            import_total: self.legs_u32("eToUser", "All"),
            export_total: self.legs_u32("eToGrid", "All"),
            load_total: self.legs_u32("eLoad", "All"),
            ups_total: self.legs_u32("eUps", "All"),
            smart_load_today,
            ac_couple_today,
        }
    }
}

// ── Identification & parameters ────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInverterInfo {
    /// e.g. `"FAAB-2525"`.
    pub fw_code: Option<String>,
    pub device_type: Option<u16>,
    pub device_type_text: Option<String>,
}

impl CloudInverterInfo {
    pub fn into_firmware(self) -> Result<FirmwareInfo, Error> {
        let fw = self.fw_code.unwrap_or_default();
        let (code, rev) = fw
            .split_once('-')
            .ok_or_else(|| Error::read(format!("unrecognised firmware code {fw:?}")))?;
        let byte = |s: &str| u8::from_str_radix(s, 16).ok();
        let (primary, secondary) = match (rev.get(..2).and_then(byte), rev.get(2..4).and_then(byte))
        {
            (Some(p), Some(s)) => (p, s),
            _ => return Err(Error::read(format!("unrecognised firmware revision {rev:?}"))),
        };
        Ok(FirmwareInfo {
            code: code.to_owned(),
            primary,
            secondary,
            device_type: self.device_type,
            model: self.device_type_text,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRemoteRead {
    /// Register values as hex, four digits per register, low byte first.
    #[serde(default)]
    pub value_frame: String,
}

impl CloudRemoteRead {
    pub fn into_parameters(self, start: u16) -> Result<RawParameters, Error> {
        let frame = self.value_frame.as_bytes();
        if frame.len() % 4 != 0 {
            return Err(Error::read(format!(
                "value frame length {} is not a whole number of registers",
                frame.len()
            )));
        }
        let mut out = RawParameters::new();
        for (register, chunk) in (start..).zip(frame.chunks_exact(4)) {
            let text = std::str::from_utf8(chunk)
                .ok()
                .filter(|t| t.is_ascii())
                .ok_or_else(|| Error::read("value frame is not ASCII hex"))?;
            let lo = u8::from_str_radix(&text[..2], 16)
                .map_err(|_| Error::read(format!("bad hex {text:?} in value frame")))?;
            let hi = u8::from_str_radix(&text[2..], 16)
                .map_err(|_| Error::read(format!("bad hex {text:?} in value frame")))?;
            out.insert(register, u16::from_le_bytes([lo, hi]));
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudQuickCharge {
    #[serde(default)]
    pub has_unclosed_quick_charge_task: bool,
}
