//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::uninstall_cmd::UninstallCli;
use crate::update_cmd::{CheckCli, ResumeCli, UpdateCli};

/// Log verbosity level for CLI output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Only show errors
    Error,
    /// Show warnings and errors (default)
    #[default]
    Warn,
    /// Show informational messages, warnings, and errors
    Info,
    /// Show debug messages and above
    Debug,
    /// Show all messages including trace-level details
    Trace,
}

impl LogLevel {
    /// Convert to tracing filter string.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Parse from string (case-insensitive).
    pub fn from_str_loose(s: &str) -> Option<LogLevel> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Filter directives for the subscriber. A non-empty `RUST_LOG` value is
    /// used as given; otherwise this level applies everywhere.
    pub fn filter_directives(self, rust_log: Option<&str>) -> String {
        match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
            Some(directives) => directives.to_string(),
            None => self.as_filter_str().to_string(),
        }
    }
}

/// Skyward - keeps an installed product up to date.
#[derive(Debug, Parser)]
#[command(name = "skyward", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Log level for diagnostics on stderr
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Warn, global = true)]
    pub log_level: LogLevel,

    /// Enable verbose output (same as --log-level debug)
    #[arg(long = "verbose", short = 'v', global = true)]
    pub verbose: bool,

    /// Enable trace output (same as --log-level trace)
    #[arg(long = "trace", global = true)]
    pub trace: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which installed product to operate on.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Client manifest of the installed product
    #[arg(long = "client", short = 'c', global = true, default_value = "client.wyc")]
    pub client: PathBuf,

    /// Install directory (defaults to the client manifest's directory)
    #[arg(long = "base-dir", short = 'b', global = true)]
    pub base_dir: Option<PathBuf>,

    /// Fetch the server manifest from this URL instead of the client's mirrors
    #[arg(long = "server", short = 's', global = true)]
    pub server: Option<String>,
}

impl TargetArgs {
    pub fn base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => self
                .client
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check whether an update is available
    Check(CheckCli),

    /// Check for an update and install it
    Update(UpdateCli),

    /// Continue a run handed off by an earlier process
    #[command(hide = true)]
    Resume(ResumeCli),

    /// Remove everything installed by updates
    Uninstall(UninstallCli),
}
