//! Executables shipped with an update.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::elevation::{InstallTargets, join_within};
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{FileIntent, UpdateDetails};

/// When an executable runs relative to file installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPhase {
    /// From the extracted payload, before files are installed.
    Before,
    /// From the install location, after files are installed.
    After,
}

fn parse_args(command: &str, args: Option<&str>) -> UpdateResult<Vec<String>> {
    match args {
        None => Ok(Vec::new()),
        Some(args) => shlex::split(args).ok_or_else(|| UpdateError::CommandFailed {
            command: format!("{command} {args}"),
            code: -1,
        }),
    }
}

/// Run every `execute` entry of `details` that belongs to `phase`.
pub async fn run_executables(
    details: &UpdateDetails,
    phase: ExecPhase,
    payload_root: &Path,
    targets: &InstallTargets,
    cancel: &CancellationToken,
) -> UpdateResult<()> {
    for op in &details.files {
        let FileIntent::Execute {
            args,
            before,
            wait,
            rollback_on_nonzero,
        } = &op.intent
        else {
            continue;
        };
        if *before != (phase == ExecPhase::Before) {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        let program: PathBuf = match phase {
            ExecPhase::Before => join_within(payload_root, &op.relative_path)?,
            ExecPhase::After => targets.resolve(&op.relative_path)?,
        };
        let program_name = program.display().to_string();
        let argv = parse_args(&program_name, args.as_deref())?;

        let mut cmd = Command::new(&program);
        cmd.args(&argv).stdin(Stdio::null());
        if let Some(dir) = program.parent() {
            cmd.current_dir(dir);
        }

        tracing::info!("Running {} {:?}", program_name, argv);
        let mut child = cmd.spawn().map_err(|e| UpdateError::CommandFailed {
            command: format!("{program_name}: {e}"),
            code: -1,
        })?;

        if !*wait {
            continue;
        }
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(UpdateError::Cancelled);
            }
        };
        if status.success() {
            continue;
        }
        let code = status.code().unwrap_or(-1);
        if *rollback_on_nonzero {
            return Err(UpdateError::CommandFailed {
                command: program_name,
                code,
            });
        }
        tracing::warn!("{} exited with {}, continuing", program_name, code);
    }
    Ok(())
}

/// Launch the post-update command without waiting. Failures are only logged.
pub fn launch_post_update(command: &str, working_dir: &Path) {
    let Some(argv) = shlex::split(command) else {
        tracing::warn!("Unparsable post-update command: {}", command);
        return;
    };
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    let result = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .spawn();
    match result {
        Ok(_) => tracing::info!("Launched post-update command {}", program),
        Err(e) => tracing::warn!("Post-update command {} failed: {}", program, e),
    }
}
