//! `sunpoll config`: where the file lives and what it resolves to.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = super::config_file(global);
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&path.display().to_string(), global.quiet);
        }
        ConfigCommand::Show => {
            let cfg = sunpoll_config::load_config_from(&path)?;
            let rendered = sunpoll_config::render_redacted(&cfg)?;
            output::print_output(rendered.trim_end(), global.quiet);
        }
    }
    Ok(())
}
