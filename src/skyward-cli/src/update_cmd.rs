//! Check, update and resume commands.

use std::io::{Write, stdout};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use skyward_common::AppDirs;
use skyward_update::{
    BlockingProcess, CheckOutcome, ContinuationRecord, Operation, ProcessDecision, ResultCode,
    RunOutcome, UpdateEvent, UpdateOffer, UpdateResult,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cli::{TargetArgs, build_resumed_updater, build_updater};

/// Check CLI.
#[derive(Debug, Parser)]
pub struct CheckCli {}

impl CheckCli {
    pub async fn run(self, target: &TargetArgs, dirs: AppDirs) -> Result<ResultCode> {
        let (updater, events) = build_updater(
            &target.client,
            &target.base_dir(),
            target.server.clone(),
            dirs,
        )?;
        let printer = spawn_event_printer(events);
        let result = updater.check_for_update().await;
        drop(updater);
        let _ = printer.await;

        Ok(match result {
            Ok(outcome) => {
                print_check_outcome(&outcome);
                RunOutcome::from(outcome).code()
            }
            Err(e) => report_error(&e),
        })
    }
}

/// Update CLI.
#[derive(Debug, Parser)]
pub struct UpdateCli {
    /// Skip confirmation prompts
    #[arg(long, short = 'y')]
    pub yes: bool,
}

impl UpdateCli {
    pub async fn run(self, target: &TargetArgs, dirs: AppDirs) -> Result<ResultCode> {
        let (updater, events) = build_updater(
            &target.client,
            &target.base_dir(),
            target.server.clone(),
            dirs,
        )?;
        let updater = updater.with_process_decision(ask_about_processes);
        let printer = spawn_event_printer(events);

        let checked = updater.check_for_update().await;
        let result = match checked {
            Ok(CheckOutcome::UpdateAvailable(offer)) => {
                print_offer(&offer);
                if self.yes || confirm("\nInstall this update? [y/N] ")? {
                    updater.download_and_apply(&offer).await
                } else {
                    println!("Update cancelled.");
                    drop(updater);
                    let _ = printer.await;
                    return Ok(ResultCode::Cancelled);
                }
            }
            Ok(other) => {
                print_check_outcome(&other);
                Ok(other.into())
            }
            Err(e) => Err(e),
        };
        drop(updater);
        let _ = printer.await;
        Ok(report_run(result))
    }
}

/// Resume CLI.
#[derive(Debug, Parser)]
pub struct ResumeCli {
    /// Continuation record written by the interrupted run
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

impl ResumeCli {
    pub async fn run(self, dirs: AppDirs) -> Result<ResultCode> {
        let record = ContinuationRecord::load(&self.file)
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let (updater, events) = build_resumed_updater(&record, dirs)?;
        let updater = updater.with_process_decision(ask_about_processes);
        let printer = spawn_event_printer(events);

        let handle = updater.spawn(Operation::Resume(Box::new(record)));
        let result = handle.await.context("Update task panicked")?;
        let _ = printer.await;
        Ok(report_run(result))
    }
}

fn print_offer(offer: &UpdateOffer) {
    println!(
        "\n→ Update available: {} → {}",
        offer.installed_version, offer.new_version
    );
    if offer.size > 0 {
        println!("  Download size: {}", skyward_update::download::format_bytes(offer.size));
    }
    if !offer.changelog.is_empty() {
        if offer.rtf_changelog {
            println!("\nChanges (rich text):");
        } else {
            println!("\nChanges:");
        }
        for line in offer.changelog.lines() {
            println!("  {line}");
        }
    }
}

fn print_check_outcome(outcome: &CheckOutcome) {
    match outcome {
        CheckOutcome::UpdateAvailable(offer) => print_offer(offer),
        CheckOutcome::AlreadyLatest {
            version,
            message,
            url,
        } => {
            println!("\n✓ Already on the latest version ({version})");
            if let Some(message) = message {
                println!("  {message}");
            }
            if let Some(url) = url {
                println!("  {url}");
            }
        }
        CheckOutcome::NoUpdateAvailable => println!("\nNo updates are published."),
    }
}

fn report_run(result: UpdateResult<RunOutcome>) -> ResultCode {
    match result {
        Ok(outcome) => {
            match &outcome {
                RunOutcome::Updated { from, to } => {
                    println!("\n✓ Updated from {from} to {to}");
                }
                RunOutcome::Relaunched => {
                    println!("\nThe update continues in a new process.");
                }
                _ => {}
            }
            outcome.code()
        }
        Err(e) => report_error(&e),
    }
}

fn report_error(e: &skyward_update::UpdateError) -> ResultCode {
    eprintln!("\nError: {e}");
    e.code()
}

/// Ask on stdin what to do about programs holding install files.
fn ask_about_processes(processes: Vec<BlockingProcess>) -> oneshot::Receiver<ProcessDecision> {
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        println!("\nThese programs must be closed before the update can continue:");
        for process in &processes {
            println!("  {} (pid {}) {}", process.name, process.pid, process.exe.display());
        }
        let decision = match confirm("Close them, then retry? [y/N] ") {
            Ok(true) => ProcessDecision::Retry,
            _ => ProcessDecision::Cancel,
        };
        let _ = tx.send(decision);
    });
    rx
}

/// Prompt and read a yes/no answer. Anything but `y` means no.
pub(crate) fn confirm(prompt: &str) -> std::io::Result<bool> {
    print!("{prompt}");
    stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(is_yes(&input))
}

fn is_yes(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Print step and download progress until the updater drops its sender.
pub fn spawn_event_printer(mut events: UnboundedReceiver<UpdateEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut progress_line = false;
        while let Some(event) = events.recv().await {
            if progress_line && !matches!(event, UpdateEvent::DownloadProgress { .. }) {
                println!();
                progress_line = false;
            }
            match event {
                UpdateEvent::StepStarted(step) if !step.is_terminal() => {
                    println!("{}", capitalize(&step.to_string()));
                }
                UpdateEvent::DownloadProgress { artifact, progress } => {
                    print!("\r{}", progress_text(artifact, &progress));
                    let _ = stdout().flush();
                    progress_line = true;
                }
                UpdateEvent::RetryingWithCatchAll { cause } => {
                    eprintln!("Patch failed ({cause}), downloading the full update");
                }
                UpdateEvent::RolledBack { step, failures } => {
                    eprintln!("Failed while {step}; changes were rolled back");
                    for failure in failures {
                        eprintln!("  could not restore: {failure}");
                    }
                }
                UpdateEvent::Relaunching { elevate: true } => {
                    println!("Administrator rights are required, relaunching");
                }
                _ => {}
            }
        }
        if progress_line {
            println!();
        }
    })
}

fn progress_text(artifact: &str, progress: &skyward_update::DownloadProgress) -> String {
    if progress.total > 0 {
        format!(
            "  {artifact}: {:>3.0}% ({}/{}) {}",
            progress.percentage(),
            progress.downloaded_human(),
            progress.total_human(),
            progress.rate_human()
        )
    } else {
        format!(
            "  {artifact}: {} {}",
            progress.downloaded_human(),
            progress.rate_human()
        )
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
