//! Update details (`IUUDFV2`): the instructions shipped inside a payload.

use crate::apply::ConfigChange;
use crate::codec::wire::{self, BLOCK_CLOSE_OFFSET, Field, MAGIC_LEN, Reader, Writer};
use crate::codec::{FormatError, Record};
use crate::verify::{NO_CHECKSUM, Sha256Digest};

use super::{
    CONFIG_CHANGE_BLOCK, FILE_OP_BLOCK, SHORTCUT_BLOCK, read_config_change, write_config_change,
};

/// Name of the details record at the root of an extracted payload.
pub const DETAILS_FILE: &str = "updtdetails.udt";

const TAG_POST_UPDATE_COMMAND: u8 = 0x01;
const TAG_PREVIOUS_SHORTCUT: u8 = 0x02;
const TAG_FOLDER_TO_DELETE: u8 = 0x03;

const TAG_FILE_PATH: u8 = 0x01;
const TAG_FILE_ARGS: u8 = 0x02;
const TAG_FILE_DELTA: u8 = 0x03;
const TAG_FILE_SHA256: u8 = 0x04;
const TAG_FILE_EXECUTE: u8 = 0xA0;
const TAG_FILE_BEFORE: u8 = 0xA1;
const TAG_FILE_WAIT: u8 = 0xA2;
const TAG_FILE_DELETE: u8 = 0xA3;
const TAG_FILE_ROLLBACK_ON_ERROR: u8 = 0xA4;

const TAG_SHORTCUT_PATH: u8 = 0x01;
const TAG_SHORTCUT_TARGET: u8 = 0x02;
const TAG_SHORTCUT_ARGS: u8 = 0x03;
const TAG_SHORTCUT_DESCRIPTION: u8 = 0x04;
const TAG_SHORTCUT_WORKING_DIR: u8 = 0x05;
const TAG_SHORTCUT_ICON: u8 = 0x06;

/// What to do with a file listed in the details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileIntent {
    Execute {
        args: Option<String>,
        /// Run from the extracted payload before files are installed.
        before: bool,
        wait: bool,
        /// A non-zero exit code fails the step and rolls the update back.
        rollback_on_nonzero: bool,
    },
    Delete,
    DeltaPatch {
        /// Patch location inside the extracted payload.
        patch_path: String,
        /// Expected digest of the patched file.
        expected_sha256: Sha256Digest,
    },
}

/// A file with special handling. Paths are prefixed with their install
/// location folder (`base/bin/app`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOp {
    pub relative_path: String,
    pub intent: FileIntent,
}

/// Descriptor of a shortcut to create. `path` and `target` are prefixed
/// with their install location folder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShortcutInfo {
    pub path: String,
    pub target: String,
    pub arguments: Option<String>,
    pub description: Option<String>,
    pub working_dir: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateDetails {
    /// Shell command run once the update is committed.
    pub post_update_command: Option<String>,
    pub config_changes: Vec<ConfigChange>,
    pub files: Vec<FileOp>,
    pub shortcuts: Vec<ShortcutInfo>,
    /// Shortcuts written by earlier versions, removed before new ones are written.
    pub previous_shortcuts: Vec<String>,
    /// Folders removed after the file operations.
    pub folders_to_delete: Vec<String>,
}

impl UpdateDetails {
    /// Payload paths holding delta patches rather than files to install.
    pub fn patch_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().filter_map(|op| match &op.intent {
            FileIntent::DeltaPatch { patch_path, .. } => Some(patch_path.as_str()),
            _ => None,
        })
    }

    pub fn has_executables(&self, before: bool) -> bool {
        self.files.iter().any(|op| {
            matches!(op.intent, FileIntent::Execute { before: b, .. } if b == before)
        })
    }
}

impl Record for UpdateDetails {
    const NAME: &'static str = "update details";
    const MAGIC: &'static [u8; MAGIC_LEN] = b"IUUDFV2";

    fn write_body(&self, w: &mut Writer) {
        w.opt_string(TAG_POST_UPDATE_COMMAND, self.post_update_command.as_deref())
            .strings(TAG_PREVIOUS_SHORTCUT, &self.previous_shortcuts)
            .strings(TAG_FOLDER_TO_DELETE, &self.folders_to_delete);
        for change in &self.config_changes {
            write_config_change(w, change);
        }
        for op in &self.files {
            write_file_op(w, op);
        }
        for shortcut in &self.shortcuts {
            write_shortcut(w, shortcut);
        }
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, FormatError> {
        let mut out = Self::default();
        loop {
            match r.next_field()? {
                Field::End => break,
                Field::Bytes(TAG_POST_UPDATE_COMMAND, b) => {
                    out.post_update_command = Some(wire::utf8(TAG_POST_UPDATE_COMMAND, b)?)
                }
                Field::Bytes(TAG_PREVIOUS_SHORTCUT, b) => out
                    .previous_shortcuts
                    .push(wire::utf8(TAG_PREVIOUS_SHORTCUT, b)?),
                Field::Bytes(TAG_FOLDER_TO_DELETE, b) => out
                    .folders_to_delete
                    .push(wire::utf8(TAG_FOLDER_TO_DELETE, b)?),
                Field::Begin(CONFIG_CHANGE_BLOCK) => out.config_changes.push(read_config_change(r)?),
                Field::Begin(FILE_OP_BLOCK) => out.files.push(read_file_op(r)?),
                Field::Begin(SHORTCUT_BLOCK) => out.shortcuts.push(read_shortcut(r)?),
                other => r.skip(other)?,
            }
        }
        Ok(out)
    }
}

fn write_file_op(w: &mut Writer, op: &FileOp) {
    w.block(FILE_OP_BLOCK, |w| {
        w.string(TAG_FILE_PATH, &op.relative_path);
        match &op.intent {
            FileIntent::Execute {
                args,
                before,
                wait,
                rollback_on_nonzero,
            } => {
                w.byte(TAG_FILE_EXECUTE, 1)
                    .opt_string(TAG_FILE_ARGS, args.as_deref())
                    .flag(TAG_FILE_BEFORE, *before)
                    .flag(TAG_FILE_WAIT, *wait)
                    .flag(TAG_FILE_ROLLBACK_ON_ERROR, *rollback_on_nonzero);
            }
            FileIntent::Delete => {
                w.byte(TAG_FILE_DELETE, 1);
            }
            FileIntent::DeltaPatch {
                patch_path,
                expected_sha256,
            } => {
                w.string(TAG_FILE_DELTA, patch_path);
                if *expected_sha256 != NO_CHECKSUM {
                    w.bytes(TAG_FILE_SHA256, expected_sha256);
                }
            }
        }
    });
}

fn read_file_op(r: &mut Reader<'_>) -> Result<FileOp, FormatError> {
    let close = FILE_OP_BLOCK + BLOCK_CLOSE_OFFSET;
    let mut path = None;
    let mut args = None;
    let mut delta = None;
    let mut sha = NO_CHECKSUM;
    let (mut execute, mut before, mut wait, mut delete, mut rollback) =
        (false, false, false, false, false);

    loop {
        match r.next_field()? {
            Field::Close(tag) if tag == close => break,
            Field::Bytes(TAG_FILE_PATH, b) => path = Some(wire::utf8(TAG_FILE_PATH, b)?),
            Field::Bytes(TAG_FILE_ARGS, b) => args = Some(wire::utf8(TAG_FILE_ARGS, b)?),
            Field::Bytes(TAG_FILE_DELTA, b) => delta = Some(wire::utf8(TAG_FILE_DELTA, b)?),
            Field::Bytes(TAG_FILE_SHA256, b) => sha = wire::fixed(TAG_FILE_SHA256, b)?,
            Field::Byte(TAG_FILE_EXECUTE, v) => execute = v != 0,
            Field::Byte(TAG_FILE_BEFORE, v) => before = v != 0,
            Field::Byte(TAG_FILE_WAIT, v) => wait = v != 0,
            Field::Byte(TAG_FILE_DELETE, v) => delete = v != 0,
            Field::Byte(TAG_FILE_ROLLBACK_ON_ERROR, v) => rollback = v != 0,
            other => r.skip(other)?,
        }
    }

    let relative_path = path.ok_or(FormatError::MissingField {
        record: "file operation",
        field: "path",
    })?;
    let count = [execute, delete, delta.is_some()]
        .iter()
        .filter(|set| **set)
        .count();
    if count != 1 {
        return Err(FormatError::FileIntent {
            path: relative_path,
            count,
        });
    }

    let intent = if execute {
        FileIntent::Execute {
            args,
            before,
            wait,
            rollback_on_nonzero: rollback,
        }
    } else if delete {
        FileIntent::Delete
    } else {
        FileIntent::DeltaPatch {
            patch_path: delta.unwrap_or_default(),
            expected_sha256: sha,
        }
    };
    Ok(FileOp {
        relative_path,
        intent,
    })
}

fn write_shortcut(w: &mut Writer, shortcut: &ShortcutInfo) {
    w.block(SHORTCUT_BLOCK, |w| {
        w.string(TAG_SHORTCUT_PATH, &shortcut.path)
            .string(TAG_SHORTCUT_TARGET, &shortcut.target)
            .opt_string(TAG_SHORTCUT_ARGS, shortcut.arguments.as_deref())
            .opt_string(TAG_SHORTCUT_DESCRIPTION, shortcut.description.as_deref())
            .opt_string(TAG_SHORTCUT_WORKING_DIR, shortcut.working_dir.as_deref())
            .opt_string(TAG_SHORTCUT_ICON, shortcut.icon.as_deref());
    });
}

fn read_shortcut(r: &mut Reader<'_>) -> Result<ShortcutInfo, FormatError> {
    let close = SHORTCUT_BLOCK + BLOCK_CLOSE_OFFSET;
    let mut out = ShortcutInfo::default();
    loop {
        match r.next_field()? {
            Field::Close(tag) if tag == close => break,
            Field::Bytes(TAG_SHORTCUT_PATH, b) => out.path = wire::utf8(TAG_SHORTCUT_PATH, b)?,
            Field::Bytes(TAG_SHORTCUT_TARGET, b) => {
                out.target = wire::utf8(TAG_SHORTCUT_TARGET, b)?
            }
            Field::Bytes(TAG_SHORTCUT_ARGS, b) => {
                out.arguments = Some(wire::utf8(TAG_SHORTCUT_ARGS, b)?)
            }
            Field::Bytes(TAG_SHORTCUT_DESCRIPTION, b) => {
                out.description = Some(wire::utf8(TAG_SHORTCUT_DESCRIPTION, b)?)
            }
            Field::Bytes(TAG_SHORTCUT_WORKING_DIR, b) => {
                out.working_dir = Some(wire::utf8(TAG_SHORTCUT_WORKING_DIR, b)?)
            }
            Field::Bytes(TAG_SHORTCUT_ICON, b) => out.icon = Some(wire::utf8(TAG_SHORTCUT_ICON, b)?),
            other => r.skip(other)?,
        }
    }
    Ok(out)
}
