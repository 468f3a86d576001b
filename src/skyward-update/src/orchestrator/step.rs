use std::fmt;

/// Stages of an update run, in execution order, followed by the terminal
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateStep {
    CheckForUpdate,
    DownloadPayload,
    SelfUpdateClient,
    ExtractPayload,
    CloseBlockingProcesses,
    PreExecute,
    BackupAndInstallFiles,
    ModifyConfig,
    PostExecute,
    CommitManifest,
    DeleteTemp,
    Done,
    Error,
    NoUpdateAvailable,
    AlreadyLatest,
}

impl UpdateStep {
    const ORDER: [UpdateStep; 15] = [
        Self::CheckForUpdate,
        Self::DownloadPayload,
        Self::SelfUpdateClient,
        Self::ExtractPayload,
        Self::CloseBlockingProcesses,
        Self::PreExecute,
        Self::BackupAndInstallFiles,
        Self::ModifyConfig,
        Self::PostExecute,
        Self::CommitManifest,
        Self::DeleteTemp,
        Self::Done,
        Self::Error,
        Self::NoUpdateAvailable,
        Self::AlreadyLatest,
    ];

    /// Stable wire value used by continuation records.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ORDER.get(usize::from(value)).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Error | Self::NoUpdateAvailable | Self::AlreadyLatest
        )
    }
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CheckForUpdate => "checking for updates",
            Self::DownloadPayload => "downloading update",
            Self::SelfUpdateClient => "updating the updater",
            Self::ExtractPayload => "extracting update",
            Self::CloseBlockingProcesses => "closing running programs",
            Self::PreExecute => "running pre-install programs",
            Self::BackupAndInstallFiles => "installing files",
            Self::ModifyConfig => "modifying configuration",
            Self::PostExecute => "running post-install programs",
            Self::CommitManifest => "recording new version",
            Self::DeleteTemp => "removing temporary files",
            Self::Done => "done",
            Self::Error => "failed",
            Self::NoUpdateAvailable => "no update available",
            Self::AlreadyLatest => "already up to date",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_follow_order() {
        for (i, step) in UpdateStep::ORDER.iter().enumerate() {
            assert_eq!(step.as_u8() as usize, i);
            assert_eq!(UpdateStep::from_u8(i as u8), Some(*step));
        }
        assert_eq!(UpdateStep::from_u8(15), None);
        assert!(UpdateStep::DownloadPayload < UpdateStep::SelfUpdateClient);
        assert!(UpdateStep::Done.is_terminal());
        assert!(!UpdateStep::DeleteTemp.is_terminal());
    }
}
