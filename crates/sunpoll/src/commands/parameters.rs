//! `sunpoll parameters`: the writable settings, no device needed.

use serde::Serialize;
use sunpoll_core::parameters::{FUNCTION_BITS, NUMERIC_PARAMETERS};
use tabled::Tabled;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Serialize, Tabled)]
struct SettingInfo {
    #[tabled(rename = "Name")]
    name: &'static str,
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Register")]
    register: u16,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Unit")]
    unit: &'static str,
}

fn catalog() -> Vec<SettingInfo> {
    let numeric = NUMERIC_PARAMETERS.iter().map(|p| SettingInfo {
        name: p.name,
        kind: "number",
        register: p.register,
        range: format!("{}..={}", p.min, p.max),
        unit: p.unit,
    });
    let switches = FUNCTION_BITS.iter().map(|b| SettingInfo {
        name: b.name,
        kind: "switch",
        register: b.register,
        range: format!("bit {}", b.bit),
        unit: "",
    });
    numeric.chain(switches).collect()
}

pub fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let settings = catalog();
    let rendered = output::render_single(global.output, settings.as_slice(), |rows| {
        output::render_table(rows)
    })?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_numbers_then_switches() {
        let settings = catalog();
        assert_eq!(settings.len(), NUMERIC_PARAMETERS.len() + FUNCTION_BITS.len());
        assert_eq!(settings[0].kind, "number");
        assert!(settings.iter().any(|s| s.name == "ac_charge" && s.kind == "switch"));
    }
}
