use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "telerelay")]
#[command(version, about = "telerelay - MQTT telemetry relay and mode switch for Telegram")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.config/telerelay/config.toml)
    #[arg(long, global = true, env = "TELERELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, env = "TELERELAY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay bot until interrupted
    Run(RunArgs),

    /// Validate the configuration and test the Telegram token
    Check(CheckArgs),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Use an in-process bus instead of connecting to the MQTT broker
    #[arg(long)]
    pub local_bus: bool,
}

#[derive(Args, Default)]
pub struct CheckArgs {
    /// Skip the Telegram getMe call
    #[arg(long)]
    pub offline: bool,

    /// Print the effective configuration as JSON (secrets masked)
    #[arg(long)]
    pub json: bool,
}
