//! CLI argument parsing and command dispatch.
//!
//! - `args` - Command-line argument structures
//! - `handlers` - Updater construction and subcommand dispatch

pub mod args;
pub mod handlers;

pub use args::{Cli, Commands, LogLevel, TargetArgs};
pub use handlers::{build_resumed_updater, build_updater, dispatch_command};
