//! Sub-command implementations.

pub mod config;
pub mod directory;
pub mod run;
