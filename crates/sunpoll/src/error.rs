//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use sunpoll_config::ConfigError;
use sunpoll_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const UNSUPPORTED: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not reach {endpoint}")]
    #[diagnostic(
        code(sunpoll::connection_failed),
        help("Check that the device or gateway is powered and reachable.\nReason: {reason}")
    )]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Every device failed to answer ({failed} polled)")]
    #[diagnostic(
        code(sunpoll::update_failed),
        help("Run with -v to see each device's error.")
    )]
    UpdateFailed { failed: usize },

    #[error("Request timed out after {millis}ms")]
    #[diagnostic(
        code(sunpoll::timeout),
        help("Raise defaults.read_timeout or check the link quality.")
    )]
    Timeout { millis: u64 },

    // ── Authentication ───────────────────────────────────────────────

    #[error("Cloud login failed: {message}")]
    #[diagnostic(
        code(sunpoll::auth_failed),
        help("Verify [cloud] username and password, or the keyring entry 'sunpoll'.")
    )]
    AuthFailed { message: String },

    // ── Devices & settings ───────────────────────────────────────────

    #[error("Device '{serial}' is not configured")]
    #[diagnostic(
        code(sunpoll::not_found),
        help("Add it as a [[devices]] entry. Run: sunpoll config show")
    )]
    DeviceNotFound { serial: String },

    #[error("Unknown setting '{name}'")]
    #[diagnostic(
        code(sunpoll::unknown_parameter),
        help("Run: sunpoll parameters")
    )]
    UnknownParameter { name: String },

    #[error("Operation '{operation}' is not supported here")]
    #[diagnostic(code(sunpoll::unsupported), help("This needs {required}."))]
    Unsupported { operation: String, required: String },

    #[error("Invalid value: {reason}")]
    #[diagnostic(code(sunpoll::validation))]
    Validation { reason: String },

    #[error("Device error: {message}")]
    #[diagnostic(code(sunpoll::protocol))]
    Protocol { message: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("No devices configured")]
    #[diagnostic(
        code(sunpoll::no_devices),
        help("Add [[devices]] entries to {path}")
    )]
    NoDevices { path: String },

    #[error(transparent)]
    #[diagnostic(code(sunpoll::config))]
    Config(#[from] ConfigError),

    // ── Internal ─────────────────────────────────────────────────────

    #[error("{0}")]
    #[diagnostic(code(sunpoll::internal))]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::UpdateFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::DeviceNotFound { .. } | Self::UnknownParameter { .. } => exit_code::NOT_FOUND,
            Self::Unsupported { .. } => exit_code::UNSUPPORTED,
            Self::Validation { .. } | Self::NoDevices { .. } | Self::Config(_) => exit_code::USAGE,
            Self::Protocol { .. } | Self::Internal(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },

            CoreError::ConnectionFailed { endpoint, reason } => {
                CliError::ConnectionFailed { endpoint, reason }
            }

            CoreError::Timeout { timeout_ms } => CliError::Timeout { millis: timeout_ms },

            CoreError::UpdateFailed { failed } => CliError::UpdateFailed { failed },

            CoreError::DeviceNotFound { serial } => CliError::DeviceNotFound { serial },

            CoreError::UnknownParameter { name } => CliError::UnknownParameter { name },

            CoreError::Unsupported {
                operation,
                required,
            } => CliError::Unsupported {
                operation,
                required,
            },

            CoreError::ValidationFailed { message } => CliError::Validation { reason: message },

            CoreError::Protocol { message } => CliError::Protocol { message },

            CoreError::Config { message } => CliError::Validation { reason: message },

            CoreError::CoordinatorStopped => {
                CliError::Internal("coordinator stopped before the command ran".into())
            }

            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}
