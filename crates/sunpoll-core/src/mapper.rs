// ── Sensor mapper ──
//
// Pure functions from raw register-level structs to canonical sensor keys.
// Scaling lives here and nowhere else. A field the link did not report is
// simply absent from the output.

use std::collections::BTreeMap;

use sunpoll_api::{
    RawBattery, RawBatteryBank, RawControllerEnergy, RawControllerRuntime, RawEnergy, RawRuntime,
};

use crate::model::Sensors;

const PORTS: usize = 4;

// ── Scaling helpers ─────────────────────────────────────────────────

fn div(raw: Option<u16>, divisor: f64) -> Option<f64> {
    raw.map(|v| f64::from(v) / divisor)
}

fn div32(raw: Option<u32>, divisor: f64) -> Option<f64> {
    raw.map(|v| f64::from(v) / divisor)
}

fn watts(raw: Option<u16>) -> Option<f64> {
    raw.map(f64::from)
}

fn signed_watts(raw: Option<i16>) -> Option<f64> {
    raw.map(f64::from)
}

/// Sum of the present values; `None` when none are present.
fn sum_present(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    values
        .into_iter()
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// `yield + discharge + import - charge - export`, never negative.
///
/// Returns `None` when none of the inputs are known.
pub fn consumption(
    pv: Option<f64>,
    discharge: Option<f64>,
    import: Option<f64>,
    charge: Option<f64>,
    export: Option<f64>,
) -> Option<f64> {
    if pv.is_none() && discharge.is_none() && import.is_none() && charge.is_none() && export.is_none() {
        return None;
    }
    let value = pv.unwrap_or(0.0) + discharge.unwrap_or(0.0) + import.unwrap_or(0.0)
        - charge.unwrap_or(0.0)
        - export.unwrap_or(0.0);
    Some(value.max(0.0))
}

// ── Inverter ────────────────────────────────────────────────────────

pub fn map_runtime(raw: &RawRuntime) -> Sensors {
    let mut s = Sensors::new();
    s.set("status_code", i64::from(raw.status));

    for (i, (v, p)) in raw.vpv.iter().zip(raw.ppv.iter()).enumerate() {
        let n = i + 1;
        s.set_opt(format!("pv{n}_voltage"), div(*v, 10.0));
        s.set_opt(format!("pv{n}_power"), watts(*p));
    }
    let pv_total = sum_present(raw.ppv.iter().map(|p| watts(*p)));
    s.set_opt("pv_total_power", pv_total);

    s.set_opt("battery_voltage", div(raw.vbat, 10.0));
    s.set_opt("soc", raw.soc.map(i64::from));
    s.set_opt("soh", raw.soh.map(i64::from));

    let charge = watts(raw.p_charge);
    let discharge = watts(raw.p_discharge);
    s.set_opt("battery_charge_power", charge);
    s.set_opt("battery_discharge_power", discharge);
    if charge.is_some() || discharge.is_some() {
        s.set("battery_power", charge.unwrap_or(0.0) - discharge.unwrap_or(0.0));
    }

    s.set_opt("grid_voltage", div(raw.vac, 10.0));
    s.set_opt("grid_frequency", div(raw.fac, 100.0));
    s.set_opt("inverter_power", watts(raw.p_inv));
    s.set_opt("rectifier_power", watts(raw.p_rec));
    s.set_opt("eps_power", watts(raw.p_eps));
    s.set_opt("eps_voltage", div(raw.v_eps, 10.0));

    let export = watts(raw.p_to_grid);
    let import = watts(raw.p_to_user);
    s.set_opt("grid_export_power", export);
    s.set_opt("grid_import_power", import);
    if export.is_some() || import.is_some() {
        s.set("grid_power", import.unwrap_or(0.0) - export.unwrap_or(0.0));
    }
    s.set_opt(
        "consumption_power",
        consumption(pv_total, discharge, import, charge, export),
    );

    s.set_opt("bus1_voltage", div(raw.vbus[0], 10.0));
    s.set_opt("bus2_voltage", div(raw.vbus[1], 10.0));
    s.set_opt("internal_temperature", raw.t_inner.map(i64::from));
    s.set_opt("radiator1_temperature", raw.t_radiator[0].map(i64::from));
    s.set_opt("radiator2_temperature", raw.t_radiator[1].map(i64::from));
    s.set_opt("battery_temperature", raw.t_bat.map(i64::from));
    s
}

pub fn map_energy(raw: &RawEnergy) -> Sensors {
    let mut s = Sensors::new();

    for (i, (today, total)) in raw.pv_today.iter().zip(raw.pv_total.iter()).enumerate() {
        let n = i + 1;
        s.set_opt(format!("pv{n}_energy_today"), div(*today, 10.0));
        s.set_opt(format!("pv{n}_energy_total"), div32(*total, 10.0));
    }
    let pv_today = sum_present(raw.pv_today.iter().map(|v| div(*v, 10.0)));
    let pv_total = sum_present(raw.pv_total.iter().map(|v| div32(*v, 10.0)));
    s.set_opt("pv_energy_today", pv_today);
    s.set_opt("pv_energy_total", pv_total);

    let today = [
        ("inverter_energy_today", raw.inverter_today),
        ("ac_charge_energy_today", raw.ac_charge_today),
        ("battery_charge_today", raw.charge_today),
        ("battery_discharge_today", raw.discharge_today),
        ("eps_energy_today", raw.eps_today),
        ("grid_export_today", raw.export_today),
        ("grid_import_today", raw.import_today),
    ];
    for (key, value) in today {
        s.set_opt(key, div(value, 10.0));
    }
    let total = [
        ("inverter_energy_total", raw.inverter_total),
        ("ac_charge_energy_total", raw.ac_charge_total),
        ("battery_charge_total", raw.charge_total),
        ("battery_discharge_total", raw.discharge_total),
        ("eps_energy_total", raw.eps_total),
        ("grid_export_total", raw.export_total),
        ("grid_import_total", raw.import_total),
    ];
    for (key, value) in total {
        s.set_opt(key, div32(value, 10.0));
    }

    s.set_opt(
        "consumption_today",
        consumption(
            pv_today,
            div(raw.discharge_today, 10.0),
            div(raw.import_today, 10.0),
            div(raw.charge_today, 10.0),
            div(raw.export_today, 10.0),
        ),
    );
    s.set_opt(
        "consumption_total",
        consumption(
            pv_total,
            div32(raw.discharge_total, 10.0),
            div32(raw.import_total, 10.0),
            div32(raw.charge_total, 10.0),
            div32(raw.export_total, 10.0),
        ),
    );
    s
}

// ── Battery bank ────────────────────────────────────────────────────

/// Bank-level sensors plus per-module sensors keyed `battery_{n}`.
pub fn map_battery(raw: &RawBatteryBank) -> (Sensors, BTreeMap<String, Sensors>) {
    let mut s = Sensors::new();
    s.set_opt("battery_module_count", raw.module_count.map(i64::from));
    s.set_opt("battery_capacity", raw.capacity_ah.map(i64::from));
    s.set_opt("battery_current", raw.current.map(|c| f64::from(c) / 100.0));
    s.set_opt("battery_charge_current_limit", div(raw.charge_current_limit, 10.0));
    s.set_opt("battery_discharge_current_limit", div(raw.discharge_current_limit, 10.0));
    s.set_opt("battery_charge_voltage_ref", div(raw.charge_voltage_ref, 10.0));
    s.set_opt("battery_discharge_cutoff_voltage", div(raw.discharge_cutoff_voltage, 10.0));
    s.set_opt("battery_max_cell_voltage", div(raw.max_cell_voltage, 1000.0));
    s.set_opt("battery_min_cell_voltage", div(raw.min_cell_voltage, 1000.0));
    if let (Some(max), Some(min)) = (raw.max_cell_voltage, raw.min_cell_voltage) {
        s.set(
            "battery_cell_voltage_delta",
            f64::from(max.saturating_sub(min)) / 1000.0,
        );
    }
    s.set_opt("battery_max_cell_temperature", raw.max_cell_temp.map(|t| f64::from(t) / 10.0));
    s.set_opt("battery_min_cell_temperature", raw.min_cell_temp.map(|t| f64::from(t) / 10.0));
    s.set_opt("battery_cycle_count", raw.cycle_count.map(i64::from));

    let modules = raw
        .modules
        .iter()
        .map(|m| (format!("battery_{}", u16::from(m.index) + 1), map_module(m)))
        .collect();
    (s, modules)
}

fn map_module(m: &RawBattery) -> Sensors {
    let mut s = Sensors::new();
    s.set_opt("serial", m.serial.clone());
    s.set_opt("voltage", div(m.voltage, 100.0));
    s.set_opt("current", m.current.map(|c| f64::from(c) / 100.0));
    s.set_opt("soc", m.soc.map(i64::from));
    s.set_opt("soh", m.soh.map(i64::from));
    s.set_opt("cycle_count", m.cycle_count.map(i64::from));
    s.set_opt("max_cell_temperature", m.max_cell_temp.map(|t| f64::from(t) / 10.0));
    s.set_opt("min_cell_temperature", m.min_cell_temp.map(|t| f64::from(t) / 10.0));
    s.set_opt("max_cell_voltage", div(m.max_cell_voltage, 1000.0));
    s.set_opt("min_cell_voltage", div(m.min_cell_voltage, 1000.0));
    s
}

// ── Grid controller ─────────────────────────────────────────────────

/// Set `{key}_l1`, `{key}_l2` and their sum under `{key}`.
fn set_legs(s: &mut Sensors, key: &str, legs: [Option<f64>; 2]) {
    s.set_opt(format!("{key}_l1"), legs[0]);
    s.set_opt(format!("{key}_l2"), legs[1]);
    s.set_opt(key.to_owned(), sum_present(legs));
}

/// Smart-port mode label for a raw status word.
pub fn port_mode(status: u16) -> Option<&'static str> {
    match status {
        0 => Some("unused"),
        1 => Some("smart_load"),
        2 => Some("ac_couple"),
        _ => None,
    }
}

pub fn map_controller_runtime(raw: &RawControllerRuntime) -> Sensors {
    let mut s = Sensors::new();

    // Split-phase service: L1 + L2 gives the line-to-line voltage.
    set_legs(&mut s, "grid_voltage", raw.grid_voltage.map(|v| div(v, 10.0)));
    set_legs(&mut s, "ups_voltage", raw.ups_voltage.map(|v| div(v, 10.0)));

    let grid_current = raw.grid_current.map(|v| div(v, 100.0));
    s.set_opt("grid_current_l1", grid_current[0]);
    s.set_opt("grid_current_l2", grid_current[1]);
    let load_current = raw.load_current.map(|v| div(v, 100.0));
    s.set_opt("load_current_l1", load_current[0]);
    s.set_opt("load_current_l2", load_current[1]);

    let grid = raw.grid_power.map(signed_watts);
    set_legs(&mut s, "grid_power", grid);
    if let Some(net) = sum_present(grid) {
        s.set("grid_import_power", net.max(0.0));
        s.set("grid_export_power", (-net).max(0.0));
    }
    set_legs(&mut s, "ups_power", raw.ups_power.map(signed_watts));
    set_legs(&mut s, "load_power", raw.load_power.map(signed_watts));
    set_legs(&mut s, "generator_power", raw.generator_power.map(signed_watts));

    for port in 0..PORTS {
        let n = port + 1;
        if let Some(legs) = raw.smart_load_power.get(port) {
            set_legs(&mut s, &format!("smart_load{n}_power"), legs.map(signed_watts));
        }
        if let Some(legs) = raw.ac_couple_power.get(port) {
            set_legs(&mut s, &format!("ac_couple{n}_power"), legs.map(signed_watts));
        }
        if let Some(mode) = raw
            .smart_port_status
            .get(port)
            .copied()
            .flatten()
            .and_then(port_mode)
        {
            s.set(format!("smart_port{n}_mode"), mode);
        }
    }

    s.set_opt("grid_frequency", div(raw.grid_frequency, 100.0));
    filter_smart_ports(&mut s, &raw.smart_port_status);
    s
}

pub fn map_controller_energy(raw: &RawControllerEnergy) -> Sensors {
    let mut s = Sensors::new();

    let today = [
        ("grid_import", raw.import_today),
        ("grid_export", raw.export_today),
        ("load_energy", raw.load_today),
        ("ups_energy", raw.ups_today),
    ];
    for (key, legs) in today {
        let legs = legs.map(|v| div(v, 10.0));
        s.set_opt(format!("{key}_l1_today"), legs[0]);
        s.set_opt(format!("{key}_l2_today"), legs[1]);
        s.set_opt(format!("{key}_today"), sum_present(legs));
    }
    let total = [
        ("grid_import", raw.import_total),
        ("grid_export", raw.export_total),
        ("load_energy", raw.load_total),
        ("ups_energy", raw.ups_total),
    ];
    for (key, legs) in total {
        let legs = legs.map(|v| div32(v, 10.0));
        s.set_opt(format!("{key}_l1_total"), legs[0]);
        s.set_opt(format!("{key}_l2_total"), legs[1]);
        s.set_opt(format!("{key}_total"), sum_present(legs));
    }

    for port in 0..PORTS {
        let n = port + 1;
        if let Some(legs) = raw.smart_load_today.get(port) {
            s.set_opt(
                format!("smart_load{n}_energy_today"),
                sum_present(legs.map(|v| div(v, 10.0))),
            );
        }
        if let Some(legs) = raw.ac_couple_today.get(port) {
            s.set_opt(
                format!("ac_couple{n}_energy_today"),
                sum_present(legs.map(|v| div(v, 10.0))),
            );
        }
    }
    s
}

/// Drop smart-port keys that do not apply to each port's mode.
///
/// A port in smart-load mode keeps only `smart_load{n}_*` and is
/// guaranteed its two leg powers; AC-couple mode is the mirror image;
/// unused ports lose both families. Ports with no status are left alone.
/// When every port reads 0 the status block is untrustworthy and nothing
/// is filtered.
pub fn filter_smart_ports(sensors: &mut Sensors, status: &[Option<u16>; PORTS]) {
    if status.iter().all(|s| *s == Some(0)) {
        return;
    }
    for (port, status) in status.iter().enumerate() {
        let n = port + 1;
        let smart = format!("smart_load{n}_");
        let couple = format!("ac_couple{n}_");
        let (drop_smart, drop_couple) = match status {
            Some(0) => (true, true),
            Some(1) => (false, true),
            Some(2) => (true, false),
            _ => continue,
        };
        sensors.retain(|key, _| {
            !((drop_smart && key.starts_with(&smart)) || (drop_couple && key.starts_with(&couple)))
        });
        let keep = match (drop_smart, drop_couple) {
            (false, true) => Some(&smart),
            (true, false) => Some(&couple),
            _ => None,
        };
        if let Some(prefix) = keep {
            sensors.ensure(format!("{prefix}power_l1"), 0.0);
            sensors.ensure(format!("{prefix}power_l2"), 0.0);
        }
    }
}

/// Controller runtime and energy merged into one sensor map.
pub fn map_controller(runtime: &RawControllerRuntime, energy: &RawControllerEnergy) -> Sensors {
    let mut s = map_controller_runtime(runtime);
    s.extend(map_controller_energy(energy));
    filter_smart_ports(&mut s, &runtime.smart_port_status);
    s
}
