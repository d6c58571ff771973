//! Command handlers: bridge CLI args to the coordinator and output formatting.

pub mod config_cmd;
pub mod health;
pub mod once;
pub mod parameters;
pub mod run;
pub mod write;

use std::path::PathBuf;

use sunpoll_core::CoordinatorConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// The config file in effect: `--config`, else the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(sunpoll_config::config_path)
}

/// Load and validate the config; at least one device is required.
pub fn coordinator_config(global: &GlobalOpts) -> Result<CoordinatorConfig, CliError> {
    let path = config_file(global);
    let cfg = sunpoll_config::load_config_from(&path)?;
    let config = sunpoll_config::to_coordinator_config(&cfg)?;
    if config.devices.is_empty() {
        return Err(CliError::NoDevices {
            path: path.display().to_string(),
        });
    }
    tracing::debug!(devices = config.devices.len(), path = %path.display(), "config loaded");
    Ok(config)
}
