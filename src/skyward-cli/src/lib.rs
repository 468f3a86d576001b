//! Skyward CLI library.
//!
//! Command-line front end of the update engine. The binary in `main.rs`
//! parses arguments, sets up logging and dispatches to the commands here.

pub mod cli;
pub mod uninstall_cmd;
pub mod update_cmd;

pub use cli::{Cli, Commands, LogLevel, dispatch_command};
