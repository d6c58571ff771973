// ── Parallel-group aggregation ──
//
// Inverters wired in parallel are presented as one synthetic device. Power
// and energy are summed across members, state-of-charge and voltages are
// averaged, and a grid controller attached to the group overrides the
// grid-side readings with its own CT measurements.

use std::collections::BTreeMap;

use sunpoll_api::RawRuntime;

use crate::mapper::consumption;
use crate::model::Sensors;
use crate::precedence::{self, Source};

/// Instantaneous power keys summed across members.
const SUMMED_POWER: &[&str] = &[
    "pv1_power",
    "pv2_power",
    "pv3_power",
    "pv_total_power",
    "battery_charge_power",
    "battery_discharge_power",
    "grid_import_power",
    "grid_export_power",
    "grid_power",
    "inverter_power",
    "rectifier_power",
    "eps_power",
    "consumption_power",
];

/// Keys averaged over the members that report them.
const AVERAGED: &[&str] = &["soc", "battery_voltage", "grid_voltage", "grid_frequency"];

/// Controller sensor → group sensor, for the CT overlay.
const OVERLAY: &[(&str, &str)] = &[
    ("grid_power", "grid_power"),
    ("grid_import_power", "grid_import_power"),
    ("grid_export_power", "grid_export_power"),
    ("load_power", "load_power"),
    ("grid_voltage", "grid_voltage"),
    ("grid_import_today", "grid_import_today"),
    ("grid_import_total", "grid_import_total"),
    ("grid_export_today", "grid_export_today"),
    ("grid_export_total", "grid_export_total"),
    ("load_energy_today", "consumption_today"),
    ("load_energy_total", "consumption_total"),
];

fn is_energy(key: &str) -> bool {
    key.ends_with("_today") || key.ends_with("_total")
}

/// Group id for one inverter: the configured override, else the device's
/// own parallel register when it reports a non-standalone role.
pub fn group_id(configured: Option<u8>, runtime: &RawRuntime) -> Option<u8> {
    configured.or_else(|| match (runtime.parallel_group, runtime.parallel_role) {
        (Some(group), Some(role)) if role != 0 => Some(group),
        _ => None,
    })
}

/// Sum, average and net the members' sensors.
pub fn sum_members(members: &[&Sensors]) -> Sensors {
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    for m in members {
        for (key, value) in m.iter() {
            if SUMMED_POWER.contains(&key.as_str()) || is_energy(key) {
                if let Some(v) = value.as_f64() {
                    *sums.entry(key.clone()).or_insert(0.0) += v;
                }
            }
        }
    }
    let mut out: Sensors = sums.into_iter().map(|(k, v)| (k, v.into())).collect();

    for key in AVERAGED {
        let values: Vec<f64> = members.iter().filter_map(|m| m.float(key)).collect();
        if !values.is_empty() {
            let count = f64::from(u32::try_from(values.len()).unwrap_or(u32::MAX));
            out.set(*key, values.iter().sum::<f64>() / count);
        }
    }

    let charge = out.float("battery_charge_power");
    let discharge = out.float("battery_discharge_power");
    if charge.is_some() || discharge.is_some() {
        out.set("battery_power", charge.unwrap_or(0.0) - discharge.unwrap_or(0.0));
    }
    out.set("member_count", i64::try_from(members.len()).unwrap_or(i64::MAX));
    out
}

/// The controller's grid-side sensors renamed into group keys.
pub fn controller_overlay(controller: &Sensors) -> Sensors {
    let mut out = Sensors::new();
    for (from, to) in OVERLAY {
        if let Some(v) = controller.get(from) {
            out.set(*to, v.clone());
        }
    }
    out
}

/// The full group sensor map.
///
/// Members' `consumption_power` values are summed. With a controller, or
/// when no member reports it, the value is re-derived after the overlay as
/// `pv + (-net_battery_power) + grid_power`, clamped at zero.
pub fn aggregate_group(members: &[&Sensors], controller: Option<&Sensors>) -> Sensors {
    let summed = sum_members(members);
    let overlay = controller.map(controller_overlay).unwrap_or_default();
    let resolved = precedence::resolve(&[
        (Source::ControllerOverlay, &overlay),
        (Source::InverterAggregate, &summed),
    ]);
    if controller.is_none() && resolved.float("consumption_power").is_some() {
        return resolved;
    }

    let mut derived = Sensors::new();
    let pv = resolved.float("pv_total_power");
    let battery = resolved.float("battery_power");
    let grid = resolved.float("grid_power");
    if pv.is_some() || battery.is_some() || grid.is_some() {
        let net_battery = battery.unwrap_or(0.0);
        let grid = grid.unwrap_or(0.0);
        // Split the signed terms so the shared clamp applies.
        derived.set_opt(
            "consumption_power",
            consumption(
                pv,
                Some((-net_battery).max(0.0)),
                Some(grid.max(0.0)),
                Some(net_battery.max(0.0)),
                Some((-grid).max(0.0)),
            ),
        );
    }
    precedence::resolve(&[
        (Source::Derived, &derived),
        (Source::InverterAggregate, &resolved),
    ])
}

// ── Group naming ────────────────────────────────────────────────────

/// Assigns letters A, B, ... to group ids in the order they are first seen.
#[derive(Debug, Default, Clone)]
pub struct GroupLetters {
    assigned: BTreeMap<u8, String>,
}

impl GroupLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Letter for `id`, assigning the next free one on first sight.
    pub fn letter(&mut self, id: u8) -> String {
        let next = self.assigned.len();
        self.assigned
            .entry(id)
            .or_insert_with(|| label_for(next))
            .clone()
    }
}

fn label_for(index: usize) -> String {
    let letters = ('A'..='Z').collect::<Vec<_>>();
    match letters.get(index) {
        Some(c) => c.to_string(),
        None => format!("{}", index + 1),
    }
}

/// Serial of the synthetic group device, e.g. `parallel_group_a`.
pub fn group_serial(letter: &str) -> String {
    format!("parallel_group_{}", letter.to_ascii_lowercase())
}

pub fn group_name(letter: &str) -> String {
    format!("Parallel Group {letter}")
}
