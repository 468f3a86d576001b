//! Cross-platform application directories for Skyward.
//!
//! Provides unified directory management following platform conventions:
//! - Linux/macOS: `~/.skyward`
//! - Windows: `%APPDATA%\skyward`
//!
//! Can be overridden with the `SKYWARD_HOME` environment variable.

use std::path::{Path, PathBuf};

/// Application name for directory paths
pub const APP_NAME: &str = "skyward";

/// Primary home directory name on Linux/macOS
pub const HOME_DIR_NAME: &str = ".skyward";

/// Application directories structure
#[derive(Debug, Clone)]
pub struct AppDirs {
    /// Configuration directory (engine config, configuration store)
    pub config_dir: PathBuf,
    /// Cache directory (run locks, staging areas)
    pub cache_dir: PathBuf,
}

impl AppDirs {
    /// Get application directories, respecting environment variable overrides.
    ///
    /// Environment variables (in priority order):
    /// - `SKYWARD_HOME`: Override all directories to this single path
    /// - `SKYWARD_CACHE_DIR`: Override cache directory only
    ///
    /// Relative paths in environment variables are resolved against the
    /// current directory.
    pub fn new() -> Option<Self> {
        if let Ok(home) = std::env::var("SKYWARD_HOME") {
            let home = absolutize(PathBuf::from(home));
            return Some(Self::rooted_at(&home));
        }

        #[cfg(target_os = "windows")]
        let (config_dir, cache_dir) = {
            let appdata = dirs::config_dir()?;
            let local_appdata = dirs::cache_dir()?;
            (appdata.join(APP_NAME), local_appdata.join(APP_NAME))
        };

        #[cfg(not(target_os = "windows"))]
        let (config_dir, cache_dir) = {
            let skyward_home = dirs::home_dir()?.join(HOME_DIR_NAME);
            (skyward_home.clone(), skyward_home.join("cache"))
        };

        let cache_dir = std::env::var("SKYWARD_CACHE_DIR")
            .map(|p| absolutize(PathBuf::from(p)))
            .unwrap_or(cache_dir);

        Some(Self {
            config_dir,
            cache_dir,
        })
    }

    /// Directories rooted at an explicit path, ignoring the environment.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.to_path_buf(),
            cache_dir: root.join("cache"),
        }
    }

    /// Engine configuration file (update.json)
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("update.json")
    }

    /// Default persistent configuration store
    pub fn config_store_file(&self) -> PathBuf {
        self.config_dir.join("config-store.json")
    }

    /// Directory holding per-target run locks
    pub fn locks_dir(&self) -> PathBuf {
        self.cache_dir.join("locks")
    }

    /// Root for per-run temporary directories
    pub fn temp_root(&self) -> PathBuf {
        self.cache_dir.join("runs")
    }

    /// Ensure all directories exist with owner-only permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.config_dir, &self.cache_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }
        Ok(())
    }
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => {
            let resolved = cwd.join(&path);
            resolved.canonicalize().unwrap_or(resolved)
        }
        Err(_) => path,
    }
}

/// Get application directories (convenience function)
pub fn get_app_dirs() -> Option<AppDirs> {
    AppDirs::new()
}
