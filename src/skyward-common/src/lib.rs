//! Common utilities shared across Skyward crates.

pub mod dirs;
pub mod file_locking;
pub mod http_client;

pub use dirs::{AppDirs, get_app_dirs};
pub use file_locking::{
    FileLockError, FileLockGuard, FileLockResult, atomic_write, try_acquire_lock,
};
pub use http_client::{ProxySetting, USER_AGENT, create_direct_client, create_download_client};
