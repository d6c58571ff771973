//! `sunpoll once`: one poll cycle, printed.

use std::sync::Arc;
use std::time::Duration;

use sunpoll_core::{Coordinator, DeviceSnapshot, Parameters, Snapshot};
use tabled::Tabled;

use crate::cli::{GlobalOpts, OnceArgs};
use crate::error::CliError;
use crate::output;

/// Upper bound on waiting for the holding-register scan.
const PARAMETER_WAIT: Duration = Duration::from_secs(120);

#[derive(Tabled)]
pub struct DeviceRow {
    #[tabled(rename = "Serial")]
    serial: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Firmware")]
    firmware: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "PV W")]
    pv: String,
    #[tabled(rename = "SOC %")]
    soc: String,
    #[tabled(rename = "Grid W")]
    grid: String,
    #[tabled(rename = "Load W")]
    load: String,
}

impl DeviceRow {
    pub fn new(device: &DeviceSnapshot, color: bool) -> Self {
        let s = &device.sensors;
        Self {
            serial: device.serial.clone(),
            kind: device.kind.to_string(),
            status: output::availability(device.available, color),
            model: output::text(device.model.as_deref()),
            firmware: output::text(device.firmware.as_deref()),
            group: output::text(device.parent_group.as_deref()),
            pv: output::number(s.float("pv_total_power")),
            soc: output::number(s.float("soc")),
            grid: output::number(s.float("grid_power")),
            load: output::number(s.float("consumption_power").or_else(|| s.float("load_power"))),
        }
    }
}

#[derive(Tabled)]
struct SettingRow {
    #[tabled(rename = "Serial")]
    serial: String,
    #[tabled(rename = "Setting")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

pub fn device_table(snapshot: &Snapshot, color: bool) -> String {
    let rows: Vec<DeviceRow> = snapshot
        .devices
        .values()
        .map(|d| DeviceRow::new(d, color))
        .collect();
    output::render_table(&rows)
}

fn settings_table(parameters: &std::collections::BTreeMap<String, Parameters>) -> String {
    let rows: Vec<SettingRow> = parameters
        .iter()
        .flat_map(|(serial, params)| {
            params.iter().map(move |(name, value)| SettingRow {
                serial: serial.clone(),
                name: name.clone(),
                value: value.to_string(),
            })
        })
        .collect();
    output::render_table(&rows)
}

pub async fn handle(args: OnceArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::coordinator_config(global)?;
    let wait_parameters = args.parameters;

    let snapshot: Arc<Snapshot> = Coordinator::oneshot(config, |coordinator| async move {
        if wait_parameters
            && tokio::time::timeout(PARAMETER_WAIT, coordinator.wait_deferred())
                .await
                .is_err()
        {
            tracing::warn!("parameter scan did not finish in time");
        }
        Ok(coordinator.snapshot())
    })
    .await?;

    let color = output::should_color(global.color);
    let rendered = output::render_single(global.output, snapshot.as_ref(), |s| {
        let mut text = device_table(s, color);
        if wait_parameters && !s.parameters.is_empty() {
            text.push_str("\n\n");
            text.push_str(&settings_table(&s.parameters));
        }
        text
    })?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}
