//! What an update run reports to its caller.

use std::path::PathBuf;

use crate::capabilities::BlockingProcess;
use crate::download::DownloadProgress;
use crate::error::ResultCode;
use crate::manifest::{ContinuationRecord, ServerManifest};
use crate::resolver::ResolvedPatch;

use super::UpdateStep;

/// Progress notification sent on the updater's event channel.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    StepStarted(UpdateStep),
    /// The step had no work for this run.
    StepSkipped(UpdateStep),
    UpdateAvailable(Box<UpdateOffer>),
    DownloadProgress {
        artifact: &'static str,
        progress: DownloadProgress,
    },
    /// Running programs hold install files; a decision is pending.
    ProcessesBlocking(Vec<BlockingProcess>),
    /// The delta patch failed and the catch-all is tried instead.
    RetryingWithCatchAll { cause: String },
    RolledBack {
        step: UpdateStep,
        failures: Vec<String>,
    },
    Relaunching { elevate: bool },
    Finished(ResultCode),
}

/// Answer to [`UpdateEvent::ProcessesBlocking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessDecision {
    /// The programs were closed; look again.
    Retry,
    Cancel,
}

/// An update found by `check_for_update`, ready for `download_and_apply`.
#[derive(Debug, Clone)]
pub struct UpdateOffer {
    pub installed_version: String,
    pub new_version: String,
    pub changelog: String,
    pub rtf_changelog: bool,
    /// Download size in bytes, 0 when unknown.
    pub size: u64,
    pub patch: ResolvedPatch,
    pub manifest: ServerManifest,
    /// Where the server manifest was saved.
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum CheckOutcome {
    UpdateAvailable(Box<UpdateOffer>),
    AlreadyLatest {
        version: String,
        message: Option<String>,
        url: Option<String>,
    },
    /// The server publishes no version choices at all.
    NoUpdateAvailable,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Available(Box<UpdateOffer>),
    Updated { from: String, to: String },
    AlreadyLatest,
    NoUpdateAvailable,
    /// Handed off to a new process.
    Relaunched,
    Uninstalled,
}

impl RunOutcome {
    pub fn code(&self) -> ResultCode {
        match self {
            Self::AlreadyLatest | Self::NoUpdateAvailable => ResultCode::NoUpdate,
            _ => ResultCode::Success,
        }
    }
}

impl From<CheckOutcome> for RunOutcome {
    fn from(outcome: CheckOutcome) -> Self {
        match outcome {
            CheckOutcome::UpdateAvailable(offer) => Self::Available(offer),
            CheckOutcome::AlreadyLatest { .. } => Self::AlreadyLatest,
            CheckOutcome::NoUpdateAvailable => Self::NoUpdateAvailable,
        }
    }
}

/// Work for [`Updater::spawn`](super::Updater::spawn).
#[derive(Debug, Clone)]
pub enum Operation {
    Check,
    /// Check, then apply whatever was found.
    Update,
    Apply(Box<UpdateOffer>),
    Resume(Box<ContinuationRecord>),
    Uninstall,
}
