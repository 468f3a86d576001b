//! Binary manifest codec.
//!
//! Every persisted record (client and server manifests, update details,
//! continuation and uninstall records) uses the same tagged wire format; see
//! [`wire`] for the layout.

mod container;
pub mod wire;

use std::path::Path;

use thiserror::Error;

use crate::error::{UpdateError, UpdateResult};

pub use container::{MAX_RECORD_LEN, unwrap_container};
pub use wire::{Field, MAGIC_LEN, Reader, Writer};

/// Structural errors raised while decoding a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unknown record magic {found:?}")]
    BadMagic { found: String },

    #[error("stream truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("stream ended before the end tag")]
    MissingEnd,

    #[error("reserved tag 0x{tag:02X}")]
    ReservedTag { tag: u8 },

    #[error("unexpected close tag 0x{tag:02X}")]
    UnexpectedClose { tag: u8 },

    #[error("blocks nested too deeply at offset {offset}")]
    TooDeep { offset: usize },

    #[error("field 0x{tag:02X} is not valid UTF-8")]
    InvalidUtf8 { tag: u8 },

    #[error("field 0x{tag:02X} has {len} bytes, expected {expected}")]
    BadLength { tag: u8, len: usize, expected: usize },

    #[error("invalid {field} value {value}")]
    InvalidDiscriminant { field: &'static str, value: u64 },

    #[error("{record} is missing required field {field}")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },

    #[error("file operation on {path} declares {count} intents, expected exactly one")]
    FileIntent { path: String, count: usize },

    #[error("version choice field 0x{tag:02X} appears before any choice")]
    OrphanChoiceField { tag: u8 },

    #[error("container: {0}")]
    Container(String),
}

/// A record with a fixed magic and a tagged body.
pub trait Record: Sized {
    /// Human-readable name used in error messages.
    const NAME: &'static str;
    const MAGIC: &'static [u8; MAGIC_LEN];

    fn write_body(&self, w: &mut Writer);

    /// Decode the fields following the magic, through the end tag.
    fn read_body(r: &mut Reader<'_>) -> Result<Self, FormatError>;

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(Self::MAGIC);
        self.write_body(&mut w);
        w.finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let data = unwrap_container(bytes)?;
        let mut r = Reader::new(&data);
        r.magic(&[Self::MAGIC])?;
        Self::read_body(&mut r)
    }
}

/// Read and decode a record file.
pub fn read_record<R: Record>(path: &Path) -> UpdateResult<R> {
    let bytes = std::fs::read(path)?;
    R::decode(&bytes).map_err(|e| UpdateError::format(R::NAME, e))
}

/// Encode a record and replace `path` atomically.
pub fn write_record<R: Record>(path: &Path, record: &R) -> UpdateResult<()> {
    skyward_common::atomic_write(path, &record.encode())
        .map_err(|e| UpdateError::Io(std::io::Error::other(e.to_string())))
}
