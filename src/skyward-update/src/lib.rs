//! Skyward Update - update engine for installed products
//!
//! Keeps an installed product current from a set of HTTP mirrors:
//! - Binary client and server manifests with mirror lists and version choices
//! - Delta or catch-all payloads, verified by SHA-256 and Ed25519 signatures
//! - Transactional install of files, shortcuts and configuration with rollback
//! - Self-update of the updater client and relaunch to gain privilege
//!
//! # Example
//!
//! ```rust,ignore
//! use skyward_update::{CheckOutcome, EngineConfig, Updater};
//!
//! let dirs = skyward_common::get_app_dirs()?;
//! let config = EngineConfig::load(&dirs);
//! let (updater, mut events) = Updater::new("client.wyc", "/opt/sky", config, dirs)?;
//!
//! if let CheckOutcome::UpdateAvailable(offer) = updater.check_for_update().await? {
//!     println!("{} -> {}", offer.installed_version, offer.new_version);
//!     updater.download_and_apply(&offer).await?;
//! }
//! ```

pub mod apply;
pub mod capabilities;
pub mod codec;
pub mod config;
pub mod config_store;
pub mod download;
pub mod elevation;
mod error;
pub mod manifest;
mod orchestrator;
pub mod resolver;
pub mod uninstall;
pub mod verify;
mod version;

pub use capabilities::{
    ArchiveExtractor, BlockingProcess, Capabilities, DeltaDecoder, ProcessInspector, Relauncher,
};
pub use config::EngineConfig;
pub use config_store::{BaseScope, ConfigStore, ConfigValue, JsonConfigStore, MemoryConfigStore};
pub use download::{DownloadProgress, DownloadRequest, Downloader};
pub use elevation::{InstallLocation, InstallTargets, InstallingTo, Privilege};
pub use error::{ErrorKind, ResultCode, UpdateError, UpdateResult};
pub use manifest::{ClientManifest, ContinuationRecord, ServerManifest, VersionChoice};
pub use orchestrator::{
    CheckOutcome, Operation, ProcessDecision, ProcessDecisionFn, RunOutcome, UpdateEvent,
    UpdateOffer, UpdateStep, Updater,
};
pub use version::{VersionComparator, compare_versions};

/// Version of the updater client (set at compile time)
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");
