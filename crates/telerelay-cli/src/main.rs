mod cli;
mod commands;
mod completions;
mod error;
mod logging;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use telerelay_core::RelayConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error::handle_error(err);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        completions::generate_completions(shell);
        return Ok(());
    }

    let _guard = logging::init(cli.verbose, cli.log_dir.as_deref())?;

    let mut config = RelayConfig::load(cli.config.as_deref())?;
    config.apply_env();

    match cli.command {
        Commands::Run(args) => commands::run::run(config, args).await,
        Commands::Check(args) => commands::check::run(config, args).await,
        Commands::Completions { .. } => Ok(()),
    }
}
