//! Error types for skyward-update.

use std::path::PathBuf;
use thiserror::Error;

use crate::codec::FormatError;

/// Result type for update operations.
pub type UpdateResult<T> = std::result::Result<T, UpdateError>;

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    // Format errors
    #[error("Corrupt or unreadable {what}: {source}")]
    Format {
        what: &'static str,
        #[source]
        source: FormatError,
    },

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Mirror {url} failed: {message}")]
    MirrorFailed { url: String, message: String },

    #[error("All {mirrors} mirror(s) failed, last error: {last}")]
    TransportExhausted {
        mirrors: usize,
        #[source]
        last: Box<UpdateError>,
    },

    #[error("No mirrors configured for {what}")]
    NoMirrors { what: &'static str },

    // Verification errors
    #[error("SHA256 verification failed: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{} is unsigned but a signing key is configured", artifact.display())]
    SignatureMissing { artifact: PathBuf },

    #[error("Signature verification failed: {reason}")]
    SignatureInvalid { reason: String },

    // Resolution errors
    #[error("No update path from {installed} to {latest}")]
    NoUpdatePathToNewest { installed: String, latest: String },

    // Installation errors
    #[error("Patch application failed: {message}")]
    PatchApplication { message: String },

    #[error("Installation failed during {step} and was rolled back: {source}")]
    InstallFailed {
        step: String,
        #[source]
        source: Box<UpdateError>,
        /// Failures hit while undoing the run; never replaces `source`.
        rollback_errors: Vec<String>,
    },

    #[error("Elevation required: {reason}")]
    ElevationRequired { reason: String },

    #[error("Files are in use by: {}", processes.join(", "))]
    ProcessesBlocking { processes: Vec<String> },

    #[error("Another update run is active for {}", target.display())]
    AlreadyRunning { target: PathBuf },

    #[error("Failed to extract archive: {message}")]
    ExtractionFailed { message: String },

    #[error("Command failed: {command} (exit code: {code})")]
    CommandFailed { command: String, code: i32 },

    #[error("Client replacement failed: {message}")]
    ReplaceFailed { message: String },

    #[error("Failed to relaunch: {message}")]
    RelaunchFailed { message: String },

    #[error("Configuration store error: {message}")]
    ConfigStore { message: String },

    #[error("Invalid path {path}: {message}")]
    InvalidPath { path: String, message: String },

    // File system errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Config errors
    #[error("Failed to load config: {message}")]
    ConfigError { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Cancelled
    #[error("Update cancelled")]
    Cancelled,
}

/// Coarse error classification used for recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Integrity,
    Signature,
    Transport,
    NoUpdatePathToNewest,
    PatchApplication,
    ElevationRequired,
    ProcessesBlocking,
    Cancelled,
    Other,
}

/// Terminal result code of an operation, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    NoUpdate,
    NoPathToNewest,
    DownloadFailed,
    InstallFailedRolledBack,
    ElevationRequired,
    ProcessesBlocking,
    Cancelled,
    Failed,
}

impl ResultCode {
    /// Process exit code for the CLI surface.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::NoUpdate => 2,
            Self::NoPathToNewest => 3,
            Self::DownloadFailed => 4,
            Self::InstallFailedRolledBack => 5,
            Self::ElevationRequired => 6,
            Self::ProcessesBlocking => 7,
            Self::Cancelled => 8,
        }
    }
}

impl UpdateError {
    pub(crate) fn format(what: &'static str, source: FormatError) -> Self {
        Self::Format { what, source }
    }

    pub(crate) fn patch(message: impl Into<String>) -> Self {
        Self::PatchApplication {
            message: message.into(),
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        Self::ConfigStore {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Format { .. } => ErrorKind::Format,
            Self::ChecksumMismatch { .. } => ErrorKind::Integrity,
            Self::SignatureMissing { .. } | Self::SignatureInvalid { .. } => ErrorKind::Signature,
            Self::Network(_)
            | Self::MirrorFailed { .. }
            | Self::TransportExhausted { .. }
            | Self::NoMirrors { .. } => ErrorKind::Transport,
            Self::NoUpdatePathToNewest { .. } => ErrorKind::NoUpdatePathToNewest,
            Self::PatchApplication { .. }
            | Self::InstallFailed { .. }
            | Self::CommandFailed { .. }
            | Self::ExtractionFailed { .. }
            | Self::ConfigStore { .. } => ErrorKind::PatchApplication,
            Self::ElevationRequired { .. } => ErrorKind::ElevationRequired,
            Self::ProcessesBlocking { .. } => ErrorKind::ProcessesBlocking,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }

    /// Result code reported to the caller for this failure.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::InstallFailed { source, .. } if source.kind() == ErrorKind::Cancelled => {
                ResultCode::Cancelled
            }
            Self::InstallFailed { .. } => ResultCode::InstallFailedRolledBack,
            _ => match self.kind() {
                ErrorKind::NoUpdatePathToNewest => ResultCode::NoPathToNewest,
                ErrorKind::Transport | ErrorKind::Integrity | ErrorKind::Signature => {
                    ResultCode::DownloadFailed
                }
                ErrorKind::ElevationRequired => ResultCode::ElevationRequired,
                ErrorKind::ProcessesBlocking => ResultCode::ProcessesBlocking,
                ErrorKind::Cancelled => ResultCode::Cancelled,
                _ => ResultCode::Failed,
            },
        }
    }

    /// Whether a failure of the selected delta patch may be retried with the
    /// catch-all patch.
    pub fn allows_catch_all_retry(&self) -> bool {
        let kind = match self {
            Self::InstallFailed { source, .. } => source.kind(),
            other => other.kind(),
        };
        !matches!(
            kind,
            ErrorKind::Cancelled | ErrorKind::ElevationRequired | ErrorKind::ProcessesBlocking
        )
    }

    /// Check if this error is a network error.
    pub fn is_network_error(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}
