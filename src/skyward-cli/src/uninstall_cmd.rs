//! Uninstall command - remove what committed updates installed.
//!
//! Only items recorded in the uninstall record are touched: files, shortcuts,
//! folders left empty and configuration keys created by updates.

use anyhow::{Context, Result};
use clap::Parser;
use skyward_common::AppDirs;
use skyward_update::uninstall::{load_record, record_path};
use skyward_update::{ResultCode, RunOutcome};

use crate::cli::{TargetArgs, build_updater};
use crate::update_cmd::confirm;

/// Uninstall CLI command.
#[derive(Debug, Parser)]
pub struct UninstallCli {
    /// Show what would be removed without removing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

impl UninstallCli {
    pub async fn run(self, target: &TargetArgs, dirs: AppDirs) -> Result<ResultCode> {
        let path = record_path(&target.client);
        let record = load_record(&path)
            .with_context(|| format!("Failed to read uninstall record {}", path.display()))?;
        if record.is_empty() {
            println!("Nothing was recorded for removal.");
            return Ok(ResultCode::Success);
        }

        println!("The following will be removed:");
        for item in record
            .files
            .iter()
            .chain(&record.shortcuts)
            .chain(&record.folders)
        {
            println!("  {item}");
        }
        for change in &record.config_changes {
            println!("  {change}");
        }

        if self.dry_run {
            println!("\nDry run: nothing was removed.");
            return Ok(ResultCode::Success);
        }
        if !self.yes && !confirm("\nProceed? [y/N] ")? {
            println!("Uninstall cancelled.");
            return Ok(ResultCode::Cancelled);
        }

        let (updater, _events) = build_updater(
            &target.client,
            &target.base_dir(),
            target.server.clone(),
            dirs,
        )?;
        match updater.uninstall().await {
            Ok(outcome) => {
                if matches!(outcome, RunOutcome::Uninstalled) {
                    println!("\n✓ Uninstalled");
                }
                Ok(outcome.code())
            }
            Err(e) => {
                eprintln!("\nError: {e}");
                Ok(e.code())
            }
        }
    }
}
