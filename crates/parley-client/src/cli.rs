//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use parley_core::LogFormat;

/// parley - peer-to-peer chat, file transfer and calls
#[derive(Debug, Parser)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, env = "PARLEY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v', global = true)]
    pub debug: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Compact)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Command,
}

/// Log line formats accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Compact => Self::Compact,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a node and chat from the terminal
    Run(RunArgs),

    /// Directory server commands
    Directory {
        #[command(subcommand)]
        action: DirectoryAction,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Options for `parley run`. Each one overrides the config file.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Our 10-digit peer id
    #[arg(long, env = "PARLEY_ID")]
    pub id: Option<String>,

    /// Port to accept peers on (0 picks a free one)
    #[arg(long, short, env = "PARLEY_PORT")]
    pub port: Option<u16>,

    /// Directory credential
    #[arg(long, env = "PARLEY_CREDENTIAL")]
    pub credential: Option<String>,

    /// Directory address as HOST:PORT
    #[arg(long, env = "PARLEY_DIRECTORY")]
    pub directory: Option<String>,

    /// Run without a directory; peers are added with /peer
    #[arg(long, conflicts_with = "directory")]
    pub no_directory: bool,

    /// Where received images and files are stored
    #[arg(long, env = "PARLEY_DOWNLOAD_DIR")]
    pub download_dir: Option<PathBuf>,

    /// Accept incoming calls without asking
    #[arg(long)]
    pub auto_accept_calls: bool,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Directory actions.
#[derive(Debug, Subcommand)]
pub enum DirectoryAction {
    /// Run a development directory server in the foreground
    Serve {
        /// Port to listen on
        #[arg(long, short)]
        port: Option<u16>,

        /// Credential peers must present
        #[arg(long, env = "PARLEY_CREDENTIAL")]
        credential: Option<String>,
    },

    /// Ask the directory where a peer listens
    Query {
        /// Peer id to look up
        id: String,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}
