//! Uninstall record (`IUUNFV1`): everything committed runs created, so it
//! can be removed again.

use crate::apply::ConfigChange;
use crate::codec::wire::{self, Field, MAGIC_LEN, Reader, Writer};
use crate::codec::{FormatError, Record};

use super::{CONFIG_CHANGE_BLOCK, read_config_change, write_config_change};

const TAG_FILE: u8 = 0x01;
const TAG_FOLDER: u8 = 0x02;
const TAG_SHORTCUT: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UninstallRecord {
    /// Absolute paths of created files.
    pub files: Vec<String>,
    /// Absolute paths of created folders.
    pub folders: Vec<String>,
    /// Absolute paths of written shortcuts.
    pub shortcuts: Vec<String>,
    /// Removals undoing created configuration keys and values.
    pub config_changes: Vec<ConfigChange>,
}

impl UninstallRecord {
    /// Fold the entries of a later run into this record, skipping duplicates.
    pub fn merge(&mut self, other: UninstallRecord) {
        fn extend<T: PartialEq>(into: &mut Vec<T>, items: Vec<T>) {
            for item in items {
                if !into.contains(&item) {
                    into.push(item);
                }
            }
        }
        extend(&mut self.files, other.files);
        extend(&mut self.folders, other.folders);
        extend(&mut self.shortcuts, other.shortcuts);
        extend(&mut self.config_changes, other.config_changes);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.folders.is_empty()
            && self.shortcuts.is_empty()
            && self.config_changes.is_empty()
    }
}

impl Record for UninstallRecord {
    const NAME: &'static str = "uninstall record";
    const MAGIC: &'static [u8; MAGIC_LEN] = b"IUUNFV1";

    fn write_body(&self, w: &mut Writer) {
        w.strings(TAG_FILE, &self.files)
            .strings(TAG_FOLDER, &self.folders)
            .strings(TAG_SHORTCUT, &self.shortcuts);
        for change in &self.config_changes {
            write_config_change(w, change);
        }
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, FormatError> {
        let mut out = Self::default();
        loop {
            match r.next_field()? {
                Field::End => break,
                Field::Bytes(TAG_FILE, b) => out.files.push(wire::utf8(TAG_FILE, b)?),
                Field::Bytes(TAG_FOLDER, b) => out.folders.push(wire::utf8(TAG_FOLDER, b)?),
                Field::Bytes(TAG_SHORTCUT, b) => out.shortcuts.push(wire::utf8(TAG_SHORTCUT, b)?),
                Field::Begin(CONFIG_CHANGE_BLOCK) => out.config_changes.push(read_config_change(r)?),
                other => r.skip(other)?,
            }
        }
        Ok(out)
    }
}
