//! `sunpoll health`: one cycle, then endpoint and cache state.

use sunpoll_core::{Coordinator, EndpointHealth, Health};
use tabled::Tabled;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "Family")]
    family: String,
    #[tabled(rename = "Devices")]
    devices: usize,
    #[tabled(rename = "Errors")]
    errors: u32,
    #[tabled(rename = "Backoff")]
    delay: String,
    #[tabled(rename = "Last failure")]
    last_failure: String,
}

impl From<&EndpointHealth> for EndpointRow {
    fn from(e: &EndpointHealth) -> Self {
        Self {
            endpoint: e.endpoint.clone(),
            family: e.family.to_string(),
            devices: e.devices,
            errors: e.failure.consecutive_errors,
            delay: format!("{:.1}s", e.failure.delay.as_secs_f64()),
            last_failure: e
                .failure
                .last_failure_kind
                .map_or_else(|| "-".into(), |k| k.to_string()),
        }
    }
}

fn detail(health: &Health) -> String {
    let rows: Vec<EndpointRow> = health.endpoints.iter().map(EndpointRow::from).collect();
    let unavailable = if health.unavailable.is_empty() {
        "none".to_owned()
    } else {
        health.unavailable.join(", ")
    };
    format!(
        "{}\n\nsnapshot #{}  cache {} valid / {} expired  unavailable: {unavailable}",
        output::render_table(&rows),
        health.snapshot_version,
        health.cache.valid,
        health.cache.expired,
    )
}

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::coordinator_config(global)?;
    let health = Coordinator::oneshot(config, |coordinator| async move { Ok(coordinator.health()) }).await?;

    let rendered = output::render_single(global.output, &health, detail)?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}
