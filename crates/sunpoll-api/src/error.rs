use thiserror::Error;

use crate::transport::TransportKind;

/// Top-level error type for the `sunpoll-api` crate.
///
/// Covers every failure mode across all links: cloud authentication,
/// HTTP transport, local connection setup, read timeouts, malformed or
/// rejected frames, and operations the addressed device kind cannot serve.
/// `sunpoll-core` maps these into its own failure taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login failed (wrong credentials, account locked, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Cloud session cookie expired or was revoked.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Could not open (or lost) a local link.
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// A read was attempted on a link that is not connected.
    #[error("Not connected to {endpoint}")]
    NotConnected { endpoint: String },

    /// A single read exceeded its deadline.
    #[error("Read timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Data ────────────────────────────────────────────────────────
    /// Malformed response, short read, CRC mismatch, or a device NACK.
    #[error("Read error: {message}")]
    Read { message: String },

    /// The device kind behind this link cannot serve the operation.
    #[error("{operation} is not supported over {transport}")]
    ProtocolUnsupported {
        operation: &'static str,
        transport: TransportKind,
    },

    // ── Cloud ───────────────────────────────────────────────────────
    /// The cloud API answered with `success: false`.
    #[error("Cloud API error: {message}")]
    CloudApi { message: String },

    /// Rate limited by the cloud API.
    #[error("Rate limited -- retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates auth has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Returns `true` if the link should be considered closed after this
    /// error; the caller must reconnect before retrying.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::NotConnected { .. } => true,
            Self::Transport(e) => e.is_connect(),
            _ => false,
        }
    }

    pub(crate) fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }

    pub(crate) fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<tokio_modbus::Error> for Error {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(io) => Self::Connection {
                endpoint: String::new(),
                reason: io.to_string(),
            },
            other => Self::read(format!("modbus protocol error: {other}")),
        }
    }
}

impl From<tokio_modbus::ExceptionCode> for Error {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        Self::read(format!("device answered with exception {code:?}"))
    }
}
