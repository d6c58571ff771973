//! `sunpoll run`: poll until Ctrl-C, printing every published snapshot.

use sunpoll_core::{Coordinator, Snapshot};
use tracing::info;

use crate::cli::{GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

/// One line per snapshot in table mode.
fn summary(snapshot: &Snapshot) -> String {
    let online = snapshot.devices.values().filter(|d| d.available).count();
    let taken = snapshot
        .taken_at
        .map_or_else(|| "-".into(), |t| t.format("%H:%M:%S").to_string());
    format!(
        "#{} at {taken}: {online}/{} devices online",
        snapshot.version,
        snapshot.devices.len()
    )
}

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::coordinator_config(global)?;
    let coordinator = Coordinator::new(config)?;
    let mut snapshots = coordinator.subscribe();
    let color = output::should_color(global.color);

    coordinator.start().await;
    info!("polling, press Ctrl-C to stop");

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break signal.map_err(CliError::from);
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let rendered = match global.output {
                    OutputFormat::Table => {
                        format!("{}\n{}", summary(&snapshot), super::once::device_table(&snapshot, color))
                    }
                    format => output::render_single(format, snapshot.as_ref(), |_| String::new())?,
                };
                output::print_output(&rendered, global.quiet);
            }
        }
    };

    coordinator.shutdown().await;
    outcome
}
