// ── Source precedence ──
//
// When more than one source reports the same sensor, this table decides
// who wins. Device fusion (local vs cloud) and group aggregation
// (controller CT vs summed inverters) both resolve through it.

use serde::Serialize;
use strum::Display;

use crate::model::{SensorValue, Sensors};

/// Where a sensor value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Source {
    /// Grid controller CT readings overlaid on a parallel group.
    ControllerOverlay,
    /// Direct Modbus / dongle link.
    Local,
    Cloud,
    /// Sum or average over group members.
    InverterAggregate,
    /// Recomputed from other resolved sensors.
    Derived,
}

/// One family of sensor keys and the order its sources are consulted in.
#[derive(Debug)]
pub struct Rule {
    pub family: &'static str,
    pub keys: &'static [&'static str],
    pub order: &'static [Source],
}

const CT_FIRST: &[Source] = &[
    Source::ControllerOverlay,
    Source::Local,
    Source::Cloud,
    Source::InverterAggregate,
];

/// Order for every key not named in [`PRECEDENCE`].
pub const DEFAULT_ORDER: &[Source] = &[Source::Local, Source::Cloud, Source::InverterAggregate];

pub const PRECEDENCE: &[Rule] = &[
    Rule {
        family: "grid_power",
        keys: &["grid_power", "grid_import_power", "grid_export_power"],
        order: CT_FIRST,
    },
    Rule {
        family: "load_power",
        keys: &["load_power"],
        order: CT_FIRST,
    },
    Rule {
        family: "grid_voltage",
        keys: &["grid_voltage"],
        order: CT_FIRST,
    },
    Rule {
        family: "grid_energy",
        keys: &[
            "grid_import_today",
            "grid_import_total",
            "grid_export_today",
            "grid_export_total",
        ],
        order: CT_FIRST,
    },
    Rule {
        family: "consumption_energy",
        keys: &["consumption_today", "consumption_total"],
        order: CT_FIRST,
    },
    Rule {
        family: "consumption_power",
        keys: &["consumption_power"],
        order: &[
            Source::Derived,
            Source::Local,
            Source::Cloud,
            Source::InverterAggregate,
        ],
    },
    Rule {
        family: "cloud_only",
        keys: &["quick_charge_active"],
        order: &[Source::Cloud],
    },
];

pub fn rule_for(key: &str) -> Option<&'static Rule> {
    PRECEDENCE.iter().find(|r| r.keys.contains(&key))
}

pub fn order_for(key: &str) -> &'static [Source] {
    rule_for(key).map_or(DEFAULT_ORDER, |r| r.order)
}

/// First source in `key`'s order that has a value.
pub fn pick<'a>(key: &str, sources: &[(Source, &'a Sensors)]) -> Option<(Source, &'a SensorValue)> {
    order_for(key).iter().find_map(|wanted| {
        sources
            .iter()
            .filter(|(source, _)| source == wanted)
            .find_map(|(source, sensors)| sensors.get(key).map(|v| (*source, v)))
    })
}

/// Merge several sources into one sensor map, key by key.
///
/// A key only some sources carry is taken from the best of those; a key
/// no permitted source carries is left out.
pub fn resolve(sources: &[(Source, &Sensors)]) -> Sensors {
    let mut keys: Vec<&String> = sources.iter().flat_map(|(_, s)| s.keys()).collect();
    keys.sort_unstable();
    keys.dedup();
    keys.into_iter()
        .filter_map(|key| pick(key, sources).map(|(_, v)| (key.clone(), v.clone())))
        .collect()
}
