// ── Command API ──
//
// Every write flows through one `Command` enum. The coordinator's command
// processor resolves names through the parameter table, picks the
// device's healthiest binding and invalidates the device cache afterwards.

use crate::error::CoreError;

/// A command plus the channel its result goes back on.
pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub response_tx: tokio::sync::oneshot::Sender<Result<CommandResult, CoreError>>,
}

/// Operations a consumer may request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Poll every binding now, ignoring interval gating.
    RefreshNow,
    /// Write a numeric setting by name, in engineering units.
    WriteParameter {
        serial: String,
        name: String,
        value: f64,
    },
    /// Flip one bit of the function register.
    SetFunction {
        serial: String,
        name: String,
        enabled: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Ok,
    /// The register and raw word that were written.
    Written { register: u16, value: u16 },
}
