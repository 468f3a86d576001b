//! Manifest records and their wire encoding.

mod client;
mod continuation;
mod details;
mod server;
mod uninstall;

pub use client::ClientManifest;
pub use continuation::{ContinuationKind, ContinuationRecord};
pub use details::{DETAILS_FILE, FileIntent, FileOp, ShortcutInfo, UpdateDetails};
pub use server::{ServerManifest, VersionChoice};
pub use uninstall::UninstallRecord;

use crate::apply::ConfigChange;
use crate::codec::wire::{self, Field, Reader, Writer};
use crate::codec::FormatError;
use crate::config_store::{BaseScope, ConfigValue};

/// Block tags shared by several records.
pub(crate) const CONFIG_CHANGE_BLOCK: u8 = 0x8E;
pub(crate) const FILE_OP_BLOCK: u8 = 0x8B;
pub(crate) const SHORTCUT_BLOCK: u8 = 0x8C;

const CLOSE_CONFIG_CHANGE: u8 = CONFIG_CHANGE_BLOCK + wire::BLOCK_CLOSE_OFFSET;

const TAG_OPERATION: u8 = 0xA0;
const TAG_SCOPE: u8 = 0xA1;
const TAG_KIND: u8 = 0xA2;
const TAG_PATH: u8 = 0x01;
const TAG_VALUE_NAME: u8 = 0x02;
const TAG_VALUE_DATA: u8 = 0x03;

const OP_CREATE_VALUE: u8 = 0;
const OP_REMOVE_VALUE: u8 = 1;
const OP_CREATE_KEY: u8 = 2;
const OP_REMOVE_KEY: u8 = 3;

fn value_kind(value: &ConfigValue) -> u8 {
    match value {
        ConfigValue::None => 0,
        ConfigValue::String(_) => 1,
        ConfigValue::ExpandString(_) => 2,
        ConfigValue::Binary(_) => 3,
        ConfigValue::DWord(_) => 4,
        ConfigValue::MultiString(_) => 7,
        ConfigValue::QWord(_) => 11,
    }
}

fn value_data(value: &ConfigValue) -> Vec<u8> {
    match value {
        ConfigValue::None => Vec::new(),
        ConfigValue::String(s) | ConfigValue::ExpandString(s) => s.as_bytes().to_vec(),
        ConfigValue::Binary(b) => b.clone(),
        ConfigValue::DWord(v) => v.to_le_bytes().to_vec(),
        ConfigValue::QWord(v) => v.to_le_bytes().to_vec(),
        ConfigValue::MultiString(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend_from_slice(item.as_bytes());
                out.push(0);
            }
            out
        }
    }
}

fn parse_value(kind: u8, data: &[u8]) -> Result<ConfigValue, FormatError> {
    Ok(match kind {
        0 => ConfigValue::None,
        1 => ConfigValue::String(wire::utf8(TAG_VALUE_DATA, data)?),
        2 => ConfigValue::ExpandString(wire::utf8(TAG_VALUE_DATA, data)?),
        3 => ConfigValue::Binary(data.to_vec()),
        4 => ConfigValue::DWord(u32::from_le_bytes(wire::fixed(TAG_VALUE_DATA, data)?)),
        7 => {
            let text = wire::utf8(TAG_VALUE_DATA, data)?;
            let body = text.strip_suffix('\0').unwrap_or(&text);
            if data.is_empty() {
                ConfigValue::MultiString(Vec::new())
            } else {
                ConfigValue::MultiString(body.split('\0').map(str::to_string).collect())
            }
        }
        11 => ConfigValue::QWord(u64::from_le_bytes(wire::fixed(TAG_VALUE_DATA, data)?)),
        other => {
            return Err(FormatError::InvalidDiscriminant {
                field: "value kind",
                value: other.into(),
            });
        }
    })
}

pub(crate) fn write_config_change(w: &mut Writer, change: &ConfigChange) {
    w.block(CONFIG_CHANGE_BLOCK, |w| match change {
        ConfigChange::CreateKey { scope, path } => {
            w.byte(TAG_OPERATION, OP_CREATE_KEY)
                .byte(TAG_SCOPE, scope.as_u8())
                .string(TAG_PATH, path);
        }
        ConfigChange::RemoveKey { scope, path } => {
            w.byte(TAG_OPERATION, OP_REMOVE_KEY)
                .byte(TAG_SCOPE, scope.as_u8())
                .string(TAG_PATH, path);
        }
        ConfigChange::CreateValue {
            scope,
            path,
            name,
            value,
        } => {
            w.byte(TAG_OPERATION, OP_CREATE_VALUE)
                .byte(TAG_SCOPE, scope.as_u8())
                .string(TAG_PATH, path)
                .string(TAG_VALUE_NAME, name)
                .byte(TAG_KIND, value_kind(value))
                .bytes(TAG_VALUE_DATA, &value_data(value));
        }
        ConfigChange::RemoveValue { scope, path, name } => {
            w.byte(TAG_OPERATION, OP_REMOVE_VALUE)
                .byte(TAG_SCOPE, scope.as_u8())
                .string(TAG_PATH, path)
                .string(TAG_VALUE_NAME, name);
        }
    });
}

/// Decode a configuration change whose opening tag was already consumed.
pub(crate) fn read_config_change(r: &mut Reader<'_>) -> Result<ConfigChange, FormatError> {
    const RECORD: &str = "configuration change";
    let mut operation = None;
    let mut scope = None;
    let mut path = None;
    let mut name = None;
    let mut kind = None;
    let mut data: Option<Vec<u8>> = None;

    loop {
        match r.next_field()? {
            Field::Close(CLOSE_CONFIG_CHANGE) => break,
            Field::Byte(TAG_OPERATION, v) => operation = Some(v),
            Field::Byte(TAG_SCOPE, v) => {
                scope = Some(BaseScope::from_u8(v).ok_or(FormatError::InvalidDiscriminant {
                    field: "base scope",
                    value: v.into(),
                })?)
            }
            Field::Byte(TAG_KIND, v) => kind = Some(v),
            Field::Bytes(TAG_PATH, b) => path = Some(wire::utf8(TAG_PATH, b)?),
            Field::Bytes(TAG_VALUE_NAME, b) => name = Some(wire::utf8(TAG_VALUE_NAME, b)?),
            Field::Bytes(TAG_VALUE_DATA, b) => data = Some(b.to_vec()),
            other => r.skip(other)?,
        }
    }

    let missing = |field| FormatError::MissingField {
        record: RECORD,
        field,
    };
    let scope = scope.ok_or_else(|| missing("scope"))?;
    let path = path.ok_or_else(|| missing("path"))?;

    match operation.ok_or_else(|| missing("operation"))? {
        OP_CREATE_KEY => Ok(ConfigChange::CreateKey { scope, path }),
        OP_REMOVE_KEY => Ok(ConfigChange::RemoveKey { scope, path }),
        OP_CREATE_VALUE => {
            let name = name.ok_or_else(|| missing("value name"))?;
            let value = parse_value(
                kind.ok_or_else(|| missing("value kind"))?,
                data.as_deref().unwrap_or_default(),
            )?;
            Ok(ConfigChange::CreateValue {
                scope,
                path,
                name,
                value,
            })
        }
        OP_REMOVE_VALUE => Ok(ConfigChange::RemoveValue {
            scope,
            path,
            name: name.ok_or_else(|| missing("value name"))?,
        }),
        other => Err(FormatError::InvalidDiscriminant {
            field: "configuration operation",
            value: other.into(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for forward-compatibility checks on every record type.

    use crate::codec::wire::{MAGIC_LEN, Writer};

    /// Re-encode `encoded` with unknown fields of every payload class
    /// injected right after the magic and again just before the end tag.
    pub fn with_unknown_fields(encoded: &[u8]) -> Vec<u8> {
        let noise = {
            let mut w = Writer::new(b"XXXXXXX");
            w.string(0x7A, "from a newer producer")
                .byte(0xBE, 3)
                .u32(0xDE, 77)
                .u64(0xFE, 1 << 40)
                .block(0x8F, |w| {
                    w.string(0x01, "nested").block(0x85, |w| {
                        w.byte(0xA0, 1);
                    });
                });
            let mut bytes = w.finish();
            bytes.pop();
            bytes.split_off(MAGIC_LEN)
        };

        let (magic, rest) = encoded.split_at(MAGIC_LEN);
        let body = &rest[..rest.len() - 1];
        let mut out = magic.to_vec();
        out.extend_from_slice(&noise);
        out.extend_from_slice(body);
        out.extend_from_slice(&noise);
        out.push(0xFF);
        out
    }
}
