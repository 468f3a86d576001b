//! Command execution handlers.

use std::path::Path;

use anyhow::{Context, Result};
use skyward_common::AppDirs;
use skyward_update::{ContinuationRecord, EngineConfig, ResultCode, UpdateEvent, Updater};
use tokio::sync::mpsc::UnboundedReceiver;

use super::args::{Cli, Commands};

/// Run the parsed command and return its result code.
pub async fn dispatch_command(cli: Cli) -> Result<ResultCode> {
    let dirs = skyward_common::get_app_dirs().context("Could not determine home directory")?;
    dirs.ensure_dirs()
        .context("Failed to create Skyward directories")?;

    match cli.command {
        Commands::Check(check) => check.run(&cli.target, dirs).await,
        Commands::Update(update) => update.run(&cli.target, dirs).await,
        Commands::Resume(resume) => resume.run(dirs).await,
        Commands::Uninstall(uninstall) => uninstall.run(&cli.target, dirs).await,
    }
}

/// Updater for the product whose client manifest is `client`.
///
/// Ctrl+C cancels the run at the next step boundary.
pub fn build_updater(
    client: &Path,
    base_dir: &Path,
    server: Option<String>,
    dirs: AppDirs,
) -> Result<(Updater, UnboundedReceiver<UpdateEvent>)> {
    let config = EngineConfig::load(&dirs);
    let (updater, events) = Updater::new(client, base_dir, config, dirs)
        .with_context(|| format!("Failed to load client manifest {}", client.display()))?;
    Ok((cancel_on_ctrl_c(updater.with_server_override(server)), events))
}

/// Updater continuing the run saved in `record`.
///
/// The record's own directories win over `dirs`, which only reflect this
/// process's environment.
pub fn build_resumed_updater(
    record: &ContinuationRecord,
    dirs: AppDirs,
) -> Result<(Updater, UnboundedReceiver<UpdateEvent>)> {
    let (updater, events) = Updater::for_continuation(record, dirs).with_context(|| {
        format!(
            "Failed to load client manifest {}",
            record.client_manifest.display()
        )
    })?;
    Ok((cancel_on_ctrl_c(updater), events))
}

fn cancel_on_ctrl_c(updater: Updater) -> Updater {
    let cancel = updater.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Cancelling at the next step");
            cancel.cancel();
        }
    });
    updater
}
