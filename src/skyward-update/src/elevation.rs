//! Install locations and the decision whether a run needs more privilege.

use std::path::{Component, Path, PathBuf};

use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::VersionChoice;

bitflags! {
    /// Locations a version choice writes to, as declared by the server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstallingTo: u32 {
        const BASE_DIR = 1;
        const SYSTEM_DIR_32 = 1 << 1;
        const SYSTEM_DIR_64 = 1 << 2;
        const COMMON_DESKTOP = 1 << 3;
        const COMMON_START_MENU = 1 << 4;
        const COMMON_APP_DATA = 1 << 5;
        const ROOT_DRIVE = 1 << 6;
        const COMMON_FILES = 1 << 7;
        /// Registers a system service or COM component.
        const SERVICE_OR_COM = 1 << 8;
    }
}

/// A directory the payload can install into. Payload archives and manifest
/// paths name them by their folder name (`base/bin/app`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallLocation {
    Base,
    System32,
    System64,
    CommonDesktop,
    CommonStartMenu,
    CommonAppData,
    RootDrive,
    CommonFiles,
}

impl InstallLocation {
    pub const ALL: [InstallLocation; 8] = [
        Self::Base,
        Self::System32,
        Self::System64,
        Self::CommonDesktop,
        Self::CommonStartMenu,
        Self::CommonAppData,
        Self::RootDrive,
        Self::CommonFiles,
    ];

    pub fn folder(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::System32 => "system",
            Self::System64 => "system64",
            Self::CommonDesktop => "desktop",
            Self::CommonStartMenu => "startmenu",
            Self::CommonAppData => "appdata",
            Self::RootDrive => "root",
            Self::CommonFiles => "commonfiles",
        }
    }

    pub fn from_folder(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|loc| loc.folder().eq_ignore_ascii_case(name))
    }

    pub fn flag(self) -> InstallingTo {
        match self {
            Self::Base => InstallingTo::BASE_DIR,
            Self::System32 => InstallingTo::SYSTEM_DIR_32,
            Self::System64 => InstallingTo::SYSTEM_DIR_64,
            Self::CommonDesktop => InstallingTo::COMMON_DESKTOP,
            Self::CommonStartMenu => InstallingTo::COMMON_START_MENU,
            Self::CommonAppData => InstallingTo::COMMON_APP_DATA,
            Self::RootDrive => InstallingTo::ROOT_DRIVE,
            Self::CommonFiles => InstallingTo::COMMON_FILES,
        }
    }
}

/// Concrete directories behind each [`InstallLocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTargets {
    pub base_dir: PathBuf,
    pub system_dir: PathBuf,
    pub system64_dir: PathBuf,
    pub common_desktop: PathBuf,
    pub common_start_menu: PathBuf,
    pub common_app_data: PathBuf,
    pub root_drive: PathBuf,
    pub common_files: PathBuf,
    /// Home directory of the invoking user.
    pub user_profile: Option<PathBuf>,
}

impl InstallTargets {
    /// Platform defaults around the product's base directory.
    #[cfg(windows)]
    pub fn for_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let env = |name: &str, fallback: &str| {
            PathBuf::from(std::env::var(name).unwrap_or_else(|_| fallback.to_string()))
        };
        let windows = env("SystemRoot", "C:\\Windows");
        let program_data = env("ProgramData", "C:\\ProgramData");
        Self {
            base_dir: base_dir.into(),
            system_dir: windows.join("SysWOW64"),
            system64_dir: windows.join("System32"),
            common_desktop: env("PUBLIC", "C:\\Users\\Public").join("Desktop"),
            common_start_menu: program_data.join("Microsoft\\Windows\\Start Menu"),
            common_files: env("CommonProgramFiles", "C:\\Program Files\\Common Files"),
            root_drive: PathBuf::from(format!(
                "{}\\",
                std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string())
            )),
            common_app_data: program_data,
            user_profile: dirs::home_dir(),
        }
    }

    /// Platform defaults around the product's base directory.
    #[cfg(not(windows))]
    pub fn for_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            system_dir: PathBuf::from("/usr/lib"),
            system64_dir: PathBuf::from("/usr/lib64"),
            common_desktop: PathBuf::from("/usr/share/applications"),
            common_start_menu: PathBuf::from("/usr/share/applications"),
            common_app_data: PathBuf::from("/var/lib"),
            root_drive: PathBuf::from("/"),
            common_files: PathBuf::from("/usr/local/share"),
            user_profile: dirs::home_dir(),
        }
    }

    pub fn with_user_profile(mut self, profile: Option<PathBuf>) -> Self {
        self.user_profile = profile;
        self
    }

    /// Redirect one location.
    pub fn with_location(mut self, location: InstallLocation, dir: impl Into<PathBuf>) -> Self {
        *self.slot(location) = dir.into();
        self
    }

    fn slot(&mut self, location: InstallLocation) -> &mut PathBuf {
        match location {
            InstallLocation::Base => &mut self.base_dir,
            InstallLocation::System32 => &mut self.system_dir,
            InstallLocation::System64 => &mut self.system64_dir,
            InstallLocation::CommonDesktop => &mut self.common_desktop,
            InstallLocation::CommonStartMenu => &mut self.common_start_menu,
            InstallLocation::CommonAppData => &mut self.common_app_data,
            InstallLocation::RootDrive => &mut self.root_drive,
            InstallLocation::CommonFiles => &mut self.common_files,
        }
    }

    pub fn path(&self, location: InstallLocation) -> &Path {
        match location {
            InstallLocation::Base => &self.base_dir,
            InstallLocation::System32 => &self.system_dir,
            InstallLocation::System64 => &self.system64_dir,
            InstallLocation::CommonDesktop => &self.common_desktop,
            InstallLocation::CommonStartMenu => &self.common_start_menu,
            InstallLocation::CommonAppData => &self.common_app_data,
            InstallLocation::RootDrive => &self.root_drive,
            InstallLocation::CommonFiles => &self.common_files,
        }
    }

    /// Map a location-prefixed manifest path (`base/bin/app` or
    /// `base\bin\app`) onto the filesystem.
    pub fn resolve(&self, relative: &str) -> UpdateResult<PathBuf> {
        let invalid = |message: &str| UpdateError::InvalidPath {
            path: relative.to_string(),
            message: message.to_string(),
        };
        let trimmed = relative.trim_start_matches(['/', '\\']);
        let (folder, rest) = trimmed.split_once(['/', '\\']).unwrap_or((trimmed, ""));
        if folder.is_empty() {
            return Err(invalid("empty path"));
        }
        let location =
            InstallLocation::from_folder(folder).ok_or_else(|| invalid("unknown install location"))?;
        join_within(self.path(location), rest)
            .map_err(|_| invalid("path escapes its install location"))
    }

    pub fn is_in_user_profile(&self, path: &Path) -> bool {
        self.user_profile
            .as_deref()
            .is_some_and(|profile| path.starts_with(profile))
    }
}

/// Join a manifest path (either separator) onto `root`. Any segment that is
/// not a plain name, such as `..` or a drive prefix, is rejected.
pub fn join_within(root: &Path, relative: &str) -> UpdateResult<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in relative.split(['/', '\\']).filter(|s| !s.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => {
                return Err(UpdateError::InvalidPath {
                    path: relative.to_string(),
                    message: format!("path escapes {}", root.display()),
                });
            }
        }
    }
    Ok(path)
}

/// Privilege of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Standard,
    Elevated,
}

static CURRENT_PRIVILEGE: Lazy<Privilege> = Lazy::new(detect_privilege);

impl Privilege {
    /// Determined once per process.
    pub fn current() -> Self {
        *CURRENT_PRIVILEGE
    }

    pub fn is_elevated(self) -> bool {
        self == Self::Elevated
    }
}

#[cfg(unix)]
fn detect_privilege() -> Privilege {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        Privilege::Elevated
    } else {
        Privilege::Standard
    }
}

#[cfg(windows)]
fn detect_privilege() -> Privilege {
    // SAFETY: IsUserAnAdmin takes no arguments and only queries the token.
    if unsafe { windows_sys::Win32::UI::Shell::IsUserAnAdmin() } != 0 {
        Privilege::Elevated
    } else {
        Privilege::Standard
    }
}

#[cfg(not(any(unix, windows)))]
fn detect_privilege() -> Privilege {
    Privilege::Standard
}

/// Why applying `choice` needs more privilege than `privilege` grants, or
/// `None` when it does not.
pub fn elevation_reason(
    privilege: Privilege,
    choice: &VersionChoice,
    targets: &InstallTargets,
) -> Option<String> {
    if privilege.is_elevated() {
        return None;
    }
    if choice.installing_to.contains(InstallingTo::SERVICE_OR_COM) {
        return Some("the update registers a service or COM component".to_string());
    }
    for location in InstallLocation::ALL {
        if !choice.installing_to.contains(location.flag()) {
            continue;
        }
        let dir = targets.path(location);
        if !targets.is_in_user_profile(dir) {
            return Some(format!("the update writes to {}", dir.display()));
        }
    }
    choice
        .sample_changes
        .iter()
        .find(|change| !change.scope().is_per_user())
        .map(|change| format!("the update changes {}", change.scope()))
}

pub fn needs_elevation(privilege: Privilege, choice: &VersionChoice, targets: &InstallTargets) -> bool {
    elevation_reason(privilege, choice, targets).is_some()
}
