//! Transactional application of an update: configuration changes, files
//! and the executables shipped with them.

mod config;
mod exec;
mod files;

pub use config::{ConfigChange, ConfigRollback, apply_config_changes};
pub use exec::{ExecPhase, launch_post_update, run_executables};
pub use files::{CommittedFiles, FileApplier, FileTransaction};
