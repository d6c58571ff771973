// ── Monotonic counter integrity ──
//
// Energy counters only move forward. A lower reading than last cycle is a
// glitch (cloud lag, a torn register read) and the previous value is kept.
// Daily counters are the exception: they legitimately drop to zero when
// the local calendar day rolls over.

use crate::model::Sensors;

pub fn is_daily(key: &str) -> bool {
    key.ends_with("_today")
}

pub fn is_lifetime(key: &str) -> bool {
    key.ends_with("_total")
}

/// Clamp every energy counter in `current` against `previous`.
///
/// `day_changed` lets `*_today` counters fall; `*_total` counters are
/// clamped unconditionally. Returns the keys that were clamped.
pub fn clamp_counters(current: &mut Sensors, previous: &Sensors, day_changed: bool) -> Vec<String> {
    let mut clamped = Vec::new();
    let keys: Vec<String> = current
        .keys()
        .filter(|k| is_lifetime(k) || (is_daily(k) && !day_changed))
        .cloned()
        .collect();
    for key in keys {
        let (Some(now), Some(before)) = (current.float(&key), previous.float(&key)) else {
            continue;
        };
        if now < before {
            current.set(key.clone(), before);
            clamped.push(key);
        }
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensors(pairs: &[(&str, f64)]) -> Sensors {
        let mut s = Sensors::new();
        for (k, v) in pairs {
            s.set(*k, *v);
        }
        s
    }

    #[test]
    fn lower_readings_are_clamped() {
        let previous = sensors(&[("grid_import_total", 1200.5), ("pv_energy_today", 8.0)]);
        let mut current = sensors(&[
            ("grid_import_total", 1199.0),
            ("pv_energy_today", 7.5),
            ("pv_total_power", 10.0),
        ]);
        let clamped = clamp_counters(&mut current, &previous, false);
        assert_eq!(clamped.len(), 2);
        assert_eq!(current.float("grid_import_total"), Some(1200.5));
        assert_eq!(current.float("pv_energy_today"), Some(8.0));
        assert_eq!(current.float("pv_total_power"), Some(10.0));
    }

    #[test]
    fn daily_counters_reset_on_day_change() {
        let previous = sensors(&[("grid_import_total", 1200.5), ("pv_energy_today", 8.0)]);
        let mut current = sensors(&[("grid_import_total", 1100.0), ("pv_energy_today", 0.1)]);
        clamp_counters(&mut current, &previous, true);
        assert_eq!(current.float("pv_energy_today"), Some(0.1));
        assert_eq!(current.float("grid_import_total"), Some(1200.5));
    }

    #[test]
    fn rising_counters_pass_through() {
        let previous = sensors(&[("battery_charge_total", 10.0)]);
        let mut current = sensors(&[("battery_charge_total", 10.1)]);
        assert!(clamp_counters(&mut current, &previous, false).is_empty());
    }
}
