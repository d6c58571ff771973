//! `sunpoll write` / `sunpoll function`: settings changes through the command queue.

use serde::Serialize;
use sunpoll_core::{CommandResult, Coordinator, CoordinatorConfig};

use crate::cli::{FunctionArgs, GlobalOpts, WriteArgs};
use crate::error::CliError;
use crate::output;

#[derive(Serialize)]
struct WriteOutcome<'a> {
    serial: &'a str,
    name: &'a str,
    register: Option<u16>,
    value: Option<u16>,
}

/// Start a foreground coordinator, run one command, stop it again.
async fn with_commands<F, Fut>(config: CoordinatorConfig, f: F) -> Result<CommandResult, CliError>
where
    F: FnOnce(Coordinator) -> Fut,
    Fut: std::future::Future<Output = Result<CommandResult, sunpoll_core::CoreError>>,
{
    let mut config = config;
    config.background = false;
    let coordinator = Coordinator::new(config)?;
    coordinator.start().await;
    let result = f(coordinator.clone()).await;
    coordinator.shutdown().await;
    Ok(result?)
}

fn report(global: &GlobalOpts, serial: &str, name: &str, result: &CommandResult) -> Result<(), CliError> {
    let (register, value) = match result {
        CommandResult::Written { register, value } => (Some(*register), Some(*value)),
        CommandResult::Ok => (None, None),
    };
    let outcome = WriteOutcome {
        serial,
        name,
        register,
        value,
    };
    let rendered = output::render_single(global.output, &outcome, |o| match (o.register, o.value) {
        (Some(register), Some(value)) => {
            format!("{}: {} written (register {register} = {value:#06x})", o.serial, o.name)
        }
        _ => format!("{}: {} updated", o.serial, o.name),
    })?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}

pub async fn handle_write(args: WriteArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::coordinator_config(global)?;
    let (serial, name, value) = (args.serial.clone(), args.name.clone(), args.value);
    let result = with_commands(config, |c| async move {
        c.write_parameter(&serial, &name, value).await
    })
    .await?;
    report(global, &args.serial, &args.name, &result)
}

pub async fn handle_function(args: FunctionArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::coordinator_config(global)?;
    let (serial, name, enabled) = (args.serial.clone(), args.name.clone(), args.state.enabled());
    let result = with_commands(config, |c| async move {
        c.set_boolean_function(&serial, &name, enabled).await
    })
    .await?;
    report(global, &args.serial, &args.name, &result)
}
