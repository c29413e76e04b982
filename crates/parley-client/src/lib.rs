//! CLI: interactive node, directory tools, configuration
//!
//! This crate provides the `parley` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod media;
pub mod repl;

pub use cli::Cli;
pub use error::{ClientError, ClientResult};
