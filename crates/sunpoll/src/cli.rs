//! Clap derive structures for the `sunpoll` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// sunpoll -- poll hybrid inverters, batteries and grid controllers
#[derive(Debug, Parser)]
#[command(
    name = "sunpoll",
    version,
    about = "Poll solar inverters, batteries and grid controllers",
    long_about = "Polls hybrid inverters, battery banks and grid controllers over the\n\
        cloud portal, Modbus TCP, Modbus RTU or the WiFi dongle, and publishes\n\
        one merged snapshot per cycle.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config dir)
    #[arg(long, env = "SUNPOLL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "SUNPOLL_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn enabled(self) -> bool {
        self == Self::On
    }
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll forever and print each published snapshot
    Run,

    /// Poll once and print the snapshot
    Once(OnceArgs),

    /// Poll once and print endpoint, cache and backoff health
    Health,

    /// Write a numeric setting
    Write(WriteArgs),

    /// Turn a function bit on or off
    Function(FunctionArgs),

    /// List writable settings and function bits
    Parameters,

    /// Inspect the configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct OnceArgs {
    /// Also wait for the holding-register scan and print settings
    #[arg(long)]
    pub parameters: bool,
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Inverter serial number
    pub serial: String,
    /// Setting name (see `sunpoll parameters`)
    pub name: String,
    /// Value in engineering units
    pub value: f64,
}

#[derive(Debug, Args)]
pub struct FunctionArgs {
    /// Inverter serial number
    pub serial: String,
    /// Function name (see `sunpoll parameters`)
    pub name: String,
    pub state: Switch,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,
    /// Print the effective configuration with secrets masked
    Show,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
