//! Continuation record written before a relaunch so the next process can
//! pick the run up where this one stopped.

use std::path::PathBuf;

use skyward_common::AppDirs;

use crate::codec::wire::{self, Field, MAGIC_LEN, Reader, Writer};
use crate::codec::{FormatError, unwrap_container};
use crate::error::{UpdateError, UpdateResult};
use crate::orchestrator::UpdateStep;

const SELF_UPDATE_MAGIC: &[u8; MAGIC_LEN] = b"IUSUFV2";
const AUTO_UPDATE_MAGIC: &[u8; MAGIC_LEN] = b"IUAUFV1";

const TAG_CLIENT_MANIFEST: u8 = 0x01;
const TAG_SERVER_MANIFEST: u8 = 0x02;
const TAG_TEMP_DIR: u8 = 0x03;
const TAG_BASE_DIR: u8 = 0x04;
const TAG_SERVER_OVERRIDE: u8 = 0x05;
const TAG_CONTINUATION_FILE: u8 = 0x06;
const TAG_PAYLOAD: u8 = 0x07;
const TAG_CONFIG_DIR: u8 = 0x08;
const TAG_CACHE_DIR: u8 = 0x09;
const TAG_CONFIG_STORE: u8 = 0x0A;
const TAG_RESUME_STEP: u8 = 0xA0;
const TAG_ELEVATED: u8 = 0xA1;
const TAG_SELF_UPDATED: u8 = 0xA2;
const TAG_CATCH_ALL: u8 = 0xA3;

/// Why the run was handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationKind {
    /// The updater client replaced itself.
    SelfUpdate,
    /// The run relaunched, typically to gain privilege.
    AutoUpdate,
}

impl ContinuationKind {
    fn magic(self) -> &'static [u8; MAGIC_LEN] {
        match self {
            Self::SelfUpdate => SELF_UPDATE_MAGIC,
            Self::AutoUpdate => AUTO_UPDATE_MAGIC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationRecord {
    pub kind: ContinuationKind,
    pub client_manifest: PathBuf,
    /// Server manifest downloaded by the interrupted run.
    pub server_manifest: PathBuf,
    pub temp_dir: PathBuf,
    pub base_dir: PathBuf,
    pub server_override: Option<String>,
    /// Where this record lives; removed once the run finishes.
    pub continuation_file: PathBuf,
    /// Payload already downloaded, if any.
    pub payload: Option<PathBuf>,
    /// App directories of the writing process. A relaunched process may run
    /// with another environment, so it takes its lock, engine config and
    /// store from here.
    pub config_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    /// Configuration store the run was writing to.
    pub config_store: Option<PathBuf>,
    pub resume_step: UpdateStep,
    pub elevated: bool,
    pub self_updated: bool,
    /// The run had already fallen back to the catch-all patch.
    pub use_catch_all: bool,
}

impl ContinuationRecord {
    pub const NAME: &'static str = "continuation record";

    pub fn encode(&self) -> Vec<u8> {
        let path = |p: &PathBuf| p.to_string_lossy().into_owned();
        let mut w = Writer::new(self.kind.magic());
        w.string(TAG_CLIENT_MANIFEST, &path(&self.client_manifest))
            .string(TAG_SERVER_MANIFEST, &path(&self.server_manifest))
            .string(TAG_TEMP_DIR, &path(&self.temp_dir))
            .string(TAG_BASE_DIR, &path(&self.base_dir))
            .opt_string(TAG_SERVER_OVERRIDE, self.server_override.as_deref())
            .string(TAG_CONTINUATION_FILE, &path(&self.continuation_file))
            .opt_string(TAG_PAYLOAD, self.payload.as_ref().map(path).as_deref())
            .opt_string(TAG_CONFIG_DIR, self.config_dir.as_ref().map(path).as_deref())
            .opt_string(TAG_CACHE_DIR, self.cache_dir.as_ref().map(path).as_deref())
            .opt_string(TAG_CONFIG_STORE, self.config_store.as_ref().map(path).as_deref())
            .byte(TAG_RESUME_STEP, self.resume_step.as_u8())
            .flag(TAG_ELEVATED, self.elevated)
            .flag(TAG_SELF_UPDATED, self.self_updated)
            .flag(TAG_CATCH_ALL, self.use_catch_all);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let data = unwrap_container(bytes)?;
        let mut r = Reader::new(&data);
        let kind = if r.magic(&[SELF_UPDATE_MAGIC, AUTO_UPDATE_MAGIC])? == SELF_UPDATE_MAGIC {
            ContinuationKind::SelfUpdate
        } else {
            ContinuationKind::AutoUpdate
        };

        let mut client_manifest = None;
        let mut server_manifest = None;
        let mut temp_dir = None;
        let mut base_dir = None;
        let mut server_override = None;
        let mut continuation_file = None;
        let mut payload = None;
        let mut config_dir = None;
        let mut cache_dir = None;
        let mut config_store = None;
        let mut resume_step = None;
        let (mut elevated, mut self_updated, mut use_catch_all) = (false, false, false);

        loop {
            match r.next_field()? {
                Field::End => break,
                Field::Bytes(tag @ TAG_CLIENT_MANIFEST, b) => {
                    client_manifest = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_SERVER_MANIFEST, b) => {
                    server_manifest = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_TEMP_DIR, b) => {
                    temp_dir = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_BASE_DIR, b) => {
                    base_dir = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_SERVER_OVERRIDE, b) => {
                    server_override = Some(wire::utf8(tag, b)?)
                }
                Field::Bytes(tag @ TAG_CONTINUATION_FILE, b) => {
                    continuation_file = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_PAYLOAD, b) => {
                    payload = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_CONFIG_DIR, b) => {
                    config_dir = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_CACHE_DIR, b) => {
                    cache_dir = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Bytes(tag @ TAG_CONFIG_STORE, b) => {
                    config_store = Some(PathBuf::from(wire::utf8(tag, b)?))
                }
                Field::Byte(TAG_RESUME_STEP, v) => {
                    resume_step = Some(UpdateStep::from_u8(v).ok_or(
                        FormatError::InvalidDiscriminant {
                            field: "resume step",
                            value: v.into(),
                        },
                    )?)
                }
                Field::Byte(TAG_ELEVATED, v) => elevated = v != 0,
                Field::Byte(TAG_SELF_UPDATED, v) => self_updated = v != 0,
                Field::Byte(TAG_CATCH_ALL, v) => use_catch_all = v != 0,
                other => r.skip(other)?,
            }
        }

        let missing = |field| FormatError::MissingField {
            record: Self::NAME,
            field,
        };
        Ok(Self {
            kind,
            client_manifest: client_manifest.ok_or_else(|| missing("client manifest"))?,
            server_manifest: server_manifest.ok_or_else(|| missing("server manifest"))?,
            temp_dir: temp_dir.ok_or_else(|| missing("temp dir"))?,
            base_dir: base_dir.ok_or_else(|| missing("base dir"))?,
            server_override,
            continuation_file: continuation_file.ok_or_else(|| missing("continuation file"))?,
            payload,
            config_dir,
            cache_dir,
            config_store,
            resume_step: resume_step.ok_or_else(|| missing("resume step"))?,
            elevated,
            self_updated,
            use_catch_all,
        })
    }

    /// App directories recorded by the writing process, when both are known.
    pub fn app_dirs(&self) -> Option<AppDirs> {
        Some(AppDirs {
            config_dir: self.config_dir.clone()?,
            cache_dir: self.cache_dir.clone()?,
        })
    }

    /// Load a record written by an earlier process.
    pub fn load(path: &std::path::Path) -> UpdateResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes).map_err(|e| UpdateError::format(Self::NAME, e))
    }

    /// Persist to `continuation_file`.
    pub fn save(&self) -> UpdateResult<()> {
        skyward_common::atomic_write(&self.continuation_file, &self.encode())
            .map_err(|e| UpdateError::Io(std::io::Error::other(e.to_string())))
    }
}
