//! parley CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use parley_core::{TracingConfig, init_tracing};

use parley_client::cli::{Cli, Command, ConfigAction, DirectoryAction};
use parley_client::commands;
use parley_client::config::ClientConfig;
use parley_client::error::{ClientError, ClientResult};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let tracing = if cli.debug {
        TracingConfig::cli_debug()
    } else {
        TracingConfig::default()
    };
    if let Err(e) = init_tracing(tracing.with_format(cli.log_format.into())) {
        eprintln!("warning: {}", e);
    }

    // Run the command
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config {
        ClientConfig::load_from(path).map_err(ClientError::Config)?
    } else {
        ClientConfig::load().map_err(ClientError::Config)?
    };

    match cli.command {
        Command::Run(ref args) => commands::run::run(&config, args).await,
        Command::Directory { action } => match action {
            DirectoryAction::Serve { port, credential } => {
                commands::directory::serve(&config, port, credential).await
            }
            DirectoryAction::Query { id } => commands::directory::query(&config, &id).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
