// ── Core error types ──
//
// Domain errors from sunpoll-core. Consumers never see HTTP status codes,
// Modbus exception codes or frame CRCs directly. The
// `From<sunpoll_api::Error>` impl folds transport-layer errors into the
// failure taxonomy the coordinator reasons about.

use serde::Serialize;
use strum::Display;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Per-device failures ──────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Cannot reach {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Read timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Operation not supported: {operation} (requires {required})")]
    Unsupported { operation: String, required: String },

    // ── Cycle-level failures ─────────────────────────────────────────
    /// Every polled device failed; the previous snapshot stays published.
    #[error("Update failed: all {failed} polled devices failed")]
    UpdateFailed { failed: usize },

    // ── Command errors ───────────────────────────────────────────────
    #[error("Device not found: {serial}")]
    DeviceNotFound { serial: String },

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Coordinator is not running")]
    CoordinatorStopped,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Failure bucket used for health reporting.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AuthenticationFailed { .. } => FailureKind::Authentication,
            Self::ConnectionFailed { .. } | Self::CoordinatorStopped => FailureKind::Connection,
            Self::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Protocol,
        }
    }
}

/// Coarse failure classification recorded per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    Connection,
    Timeout,
    Protocol,
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<sunpoll_api::Error> for CoreError {
    fn from(err: sunpoll_api::Error) -> Self {
        match err {
            sunpoll_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            sunpoll_api::Error::SessionExpired => CoreError::AuthenticationFailed {
                message: "Session expired -- re-authentication required".into(),
            },
            sunpoll_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_ms: 0 }
                } else {
                    CoreError::ConnectionFailed {
                        endpoint: e
                            .url()
                            .map(|u| u.origin().ascii_serialization())
                            .unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                }
            }
            sunpoll_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid URL: {e}"),
            },
            sunpoll_api::Error::Tls(message) => CoreError::ConnectionFailed {
                endpoint: "<tls>".into(),
                reason: message,
            },
            sunpoll_api::Error::Connection { endpoint, reason } => {
                CoreError::ConnectionFailed { endpoint, reason }
            }
            sunpoll_api::Error::NotConnected { endpoint } => CoreError::ConnectionFailed {
                endpoint,
                reason: "link not connected".into(),
            },
            sunpoll_api::Error::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            sunpoll_api::Error::Read { message } => CoreError::Protocol { message },
            sunpoll_api::Error::ProtocolUnsupported {
                operation,
                transport,
            } => CoreError::Unsupported {
                operation: operation.into(),
                required: format!("a device kind served by {transport}"),
            },
            sunpoll_api::Error::CloudApi { message } => CoreError::Protocol { message },
            sunpoll_api::Error::RateLimited { retry_after_secs } => CoreError::ConnectionFailed {
                endpoint: "cloud".into(),
                reason: format!("rate limited, retry after {retry_after_secs}s"),
            },
            sunpoll_api::Error::Deserialization { message, body: _ } => {
                CoreError::Protocol { message }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_taxonomy() {
        let timeout: CoreError = sunpoll_api::Error::Timeout { timeout_ms: 500 }.into();
        assert_eq!(timeout.kind(), FailureKind::Timeout);

        let nack: CoreError = sunpoll_api::Error::Read {
            message: "exception IllegalDataAddress".into(),
        }
        .into();
        assert_eq!(nack.kind(), FailureKind::Protocol);

        let expired: CoreError = sunpoll_api::Error::SessionExpired.into();
        assert_eq!(expired.kind(), FailureKind::Authentication);

        let lost: CoreError = sunpoll_api::Error::Connection {
            endpoint: "10.0.0.5:502".into(),
            reason: "reset by peer".into(),
        }
        .into();
        assert!(matches!(lost, CoreError::ConnectionFailed { ref endpoint, .. } if endpoint == "10.0.0.5:502"));
    }
}
