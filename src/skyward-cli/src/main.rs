//! Skyward CLI main entry point.

use anyhow::Result;
use clap::Parser;
use skyward_cli::{Cli, LogLevel, dispatch_command};
use tracing_subscriber::EnvFilter;

fn init_logging(cli: &Cli) {
    let log_level = if cli.trace {
        LogLevel::Trace
    } else if cli.verbose {
        LogLevel::Debug
    } else if let Ok(env_level) = std::env::var("SKYWARD_LOG_LEVEL") {
        LogLevel::from_str_loose(&env_level).unwrap_or(cli.log_level)
    } else {
        cli.log_level
    };

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::try_new(log_level.filter_directives(rust_log.as_deref()))
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_filter_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = dispatch_command(cli).await?;
    std::process::exit(code.exit_code());
}
