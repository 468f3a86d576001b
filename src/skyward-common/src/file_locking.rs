//! Advisory file locking and atomic writes.
//!
//! Run locks guarantee that at most one update run touches an installation
//! target at a time; atomic writes keep manifests and stores from ever being
//! observed half-written.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Error type for file locking operations.
#[derive(Debug, thiserror::Error)]
pub enum FileLockError {
    /// Lock acquisition failed.
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),
    /// I/O error during operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Atomic write failed.
    #[error("Atomic write failed: {0}")]
    AtomicWriteFailed(String),
}

/// Result type for file locking operations.
pub type FileLockResult<T> = Result<T, FileLockError>;

/// A guard that releases the file lock when dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    /// Get the path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the owning process id in the lock file (diagnostics only).
    pub fn stamp_owner(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        writeln!(self.file, "{}", std::process::id())?;
        self.file.sync_all()
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = unlock_file(&self.file) {
            tracing::debug!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Try to take an exclusive lock without waiting.
///
/// Creates the lock file (and its parent directory) when it does not exist
/// yet. Returns `Ok(None)` when another holder owns the lock.
pub fn try_acquire_lock(path: impl AsRef<Path>) -> FileLockResult<Option<FileLockGuard>> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    if try_lock_file(&file)? {
        Ok(Some(FileLockGuard { file, path }))
    } else {
        Ok(None)
    }
}

// Platform-specific locking implementations

#[cfg(unix)]
fn try_lock_file(file: &File) -> FileLockResult<bool> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(true)
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(FileLockError::LockFailed(format!("flock failed: {}", err)))
        }
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> FileLockResult<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
    if result == 0 {
        Ok(())
    } else {
        Err(FileLockError::LockFailed(format!(
            "unlock failed: {}",
            io::Error::last_os_error()
        )))
    }
}

#[cfg(windows)]
fn try_lock_file(file: &File) -> FileLockResult<bool> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;

    let mut overlapped =
        unsafe { std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>() };

    let result = unsafe { LockFileEx(handle, flags, 0, u32::MAX, u32::MAX, &mut overlapped) };

    if result != 0 {
        Ok(true)
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(FileLockError::LockFailed(format!(
                "LockFileEx failed: {}",
                err
            )))
        }
    }
}

#[cfg(windows)]
fn unlock_file(file: &File) -> FileLockResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;

    let handle = file.as_raw_handle() as HANDLE;
    let mut overlapped =
        unsafe { std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>() };

    let result = unsafe { UnlockFileEx(handle, 0, u32::MAX, u32::MAX, &mut overlapped) };

    if result != 0 {
        Ok(())
    } else {
        Err(FileLockError::LockFailed(format!(
            "UnlockFileEx failed: {}",
            io::Error::last_os_error()
        )))
    }
}

/// Perform an atomic file write using the write-to-temp-then-rename pattern.
///
/// Readers observe either the old or the new content, never a mix.
pub fn atomic_write(path: impl AsRef<Path>, content: &[u8]) -> FileLockResult<()> {
    let path = path.as_ref();
    let parent = path.parent().ok_or_else(|| {
        FileLockError::AtomicWriteFailed("Cannot determine parent directory".to_string())
    })?;

    if !parent.as_os_str().is_empty() && !parent.exists() {
        fs::create_dir_all(parent)?;
    }

    // Same directory so the rename never crosses filesystems
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        temp_file.write_all(content)?;
        temp_file.sync_all()?;
    }

    #[cfg(windows)]
    {
        // rename does not replace an existing target on every Windows filesystem
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        FileLockError::AtomicWriteFailed(format!("rename failed: {}", e))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        atomic_write(&path, b"Hello, World!").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Hello, World!");
    }

    #[test]
    fn test_atomic_write_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("test.txt");

        atomic_write(&path, b"Original").unwrap();
        atomic_write(&path, b"Updated").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Updated");
    }

    #[test]
    fn test_exclusive_lock_is_not_reentrant_across_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locks").join("target.lock");

        let first = try_acquire_lock(&path).unwrap();
        assert!(first.is_some());
        assert!(path.exists());

        let second = try_acquire_lock(&path).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = try_acquire_lock(&path).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn test_stamp_owner_writes_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("target.lock");
        let mut guard = try_acquire_lock(&path).unwrap().unwrap();
        guard.stamp_owner().unwrap();
        let content = fs::read_to_string(guard.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
