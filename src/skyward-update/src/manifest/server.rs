//! Server manifest (`IUSDFV2`): what the newest release is and how to reach it.

use crate::apply::ConfigChange;
use crate::codec::wire::{self, Field, MAGIC_LEN, Reader, Writer};
use crate::codec::{FormatError, Record};
use crate::elevation::InstallingTo;
use crate::verify::{NO_CHECKSUM, Sha256Digest};
use crate::version::VersionComparator;

use super::{CONFIG_CHANGE_BLOCK, read_config_change, write_config_change};

const TAG_NEW_VERSION: u8 = 0x01;
const TAG_MIRROR: u8 = 0x02;
const TAG_MIN_CLIENT_VERSION: u8 = 0x03;
const TAG_NO_UPDATE_TEXT: u8 = 0x04;
const TAG_NO_UPDATE_URL: u8 = 0x05;
const TAG_CLIENT_UPDATE_MIRROR: u8 = 0x06;

// Fields of the current version choice. 0x0B starts a new one.
const TAG_CHOICE: u8 = 0x0B;
const TAG_CHANGES: u8 = 0x0C;
const TAG_PAYLOAD_MIRROR: u8 = 0x0D;
const TAG_SHA256: u8 = 0x0E;
const TAG_SIGNATURE: u8 = 0x0F;
const TAG_RTF: u8 = 0xA0;
const TAG_INSTALLING_TO: u8 = 0xC1;
const TAG_SIZE: u8 = 0xE0;

/// One way of reaching the newest version from a given installed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChoice {
    /// Installed version this patch upgrades from.
    pub version: String,
    pub changes: String,
    /// `changes` is rich text rather than plain text.
    pub rtf_changes: bool,
    pub mirrors: Vec<String>,
    pub size: u64,
    /// All zero when no checksum is declared.
    pub sha256: Sha256Digest,
    /// Detached Ed25519 signature over the payload's SHA-256 digest.
    pub signature: Option<Vec<u8>>,
    pub installing_to: InstallingTo,
    /// Representative changes used to test whether elevation is needed.
    pub sample_changes: Vec<ConfigChange>,
}

impl VersionChoice {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            changes: String::new(),
            rtf_changes: false,
            mirrors: Vec::new(),
            size: 0,
            sha256: NO_CHECKSUM,
            signature: None,
            installing_to: InstallingTo::empty(),
            sample_changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerManifest {
    pub new_version: String,
    /// Mirrors of this manifest; replaces the client's list on commit.
    pub mirrors: Vec<String>,
    /// Oldest updater client able to apply this release.
    pub min_client_version: Option<String>,
    pub no_update_text: Option<String>,
    pub no_update_url: Option<String>,
    /// Mirrors of the server manifest describing updates to the client itself.
    pub client_update_mirrors: Vec<String>,
    pub choices: Vec<VersionChoice>,
}

impl ServerManifest {
    /// Index of the catch-all choice, whose version equals the newest version.
    pub fn catch_all_index(&self, cmp: &VersionComparator) -> Option<usize> {
        self.choices
            .iter()
            .position(|c| cmp.equal(&c.version, &self.new_version))
    }

    pub fn catch_all(&self, cmp: &VersionComparator) -> Option<&VersionChoice> {
        self.catch_all_index(cmp).map(|i| &self.choices[i])
    }
}

impl Record for ServerManifest {
    const NAME: &'static str = "server manifest";
    const MAGIC: &'static [u8; MAGIC_LEN] = b"IUSDFV2";

    fn write_body(&self, w: &mut Writer) {
        w.string(TAG_NEW_VERSION, &self.new_version)
            .strings(TAG_MIRROR, &self.mirrors)
            .opt_string(TAG_MIN_CLIENT_VERSION, self.min_client_version.as_deref())
            .opt_string(TAG_NO_UPDATE_TEXT, self.no_update_text.as_deref())
            .opt_string(TAG_NO_UPDATE_URL, self.no_update_url.as_deref())
            .strings(TAG_CLIENT_UPDATE_MIRROR, &self.client_update_mirrors);

        for choice in &self.choices {
            w.string(TAG_CHOICE, &choice.version)
                .string(TAG_CHANGES, &choice.changes)
                .flag(TAG_RTF, choice.rtf_changes)
                .strings(TAG_PAYLOAD_MIRROR, &choice.mirrors)
                .u64(TAG_SIZE, choice.size)
                .u32(TAG_INSTALLING_TO, choice.installing_to.bits());
            if choice.sha256 != NO_CHECKSUM {
                w.bytes(TAG_SHA256, &choice.sha256);
            }
            if let Some(signature) = &choice.signature {
                w.bytes(TAG_SIGNATURE, signature);
            }
            for change in &choice.sample_changes {
                write_config_change(w, change);
            }
        }
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, FormatError> {
        let mut out = Self::default();
        let mut have_version = false;

        loop {
            let field = r.next_field()?;
            match field {
                Field::End => break,
                Field::Bytes(TAG_NEW_VERSION, b) => {
                    out.new_version = wire::utf8(TAG_NEW_VERSION, b)?;
                    have_version = true;
                }
                Field::Bytes(TAG_MIRROR, b) => out.mirrors.push(wire::utf8(TAG_MIRROR, b)?),
                Field::Bytes(TAG_MIN_CLIENT_VERSION, b) => {
                    out.min_client_version = Some(wire::utf8(TAG_MIN_CLIENT_VERSION, b)?)
                }
                Field::Bytes(TAG_NO_UPDATE_TEXT, b) => {
                    out.no_update_text = Some(wire::utf8(TAG_NO_UPDATE_TEXT, b)?)
                }
                Field::Bytes(TAG_NO_UPDATE_URL, b) => {
                    out.no_update_url = Some(wire::utf8(TAG_NO_UPDATE_URL, b)?)
                }
                Field::Bytes(TAG_CLIENT_UPDATE_MIRROR, b) => out
                    .client_update_mirrors
                    .push(wire::utf8(TAG_CLIENT_UPDATE_MIRROR, b)?),
                Field::Bytes(TAG_CHOICE, b) => {
                    out.choices.push(VersionChoice::new(wire::utf8(TAG_CHOICE, b)?))
                }
                Field::Bytes(TAG_CHANGES, _)
                | Field::Bytes(TAG_PAYLOAD_MIRROR, _)
                | Field::Bytes(TAG_SHA256, _)
                | Field::Bytes(TAG_SIGNATURE, _)
                | Field::Byte(TAG_RTF, _)
                | Field::U32(TAG_INSTALLING_TO, _)
                | Field::U64(TAG_SIZE, _)
                | Field::Begin(CONFIG_CHANGE_BLOCK) => {
                    let Some(choice) = out.choices.last_mut() else {
                        return Err(FormatError::OrphanChoiceField {
                            tag: field_tag(field),
                        });
                    };
                    read_choice_field(r, choice, field)?;
                }
                other => r.skip(other)?,
            }
        }

        if !have_version {
            return Err(FormatError::MissingField {
                record: Self::NAME,
                field: "new version",
            });
        }
        Ok(out)
    }
}

fn field_tag(field: Field<'_>) -> u8 {
    match field {
        Field::Bytes(t, _) | Field::Byte(t, _) | Field::U32(t, _) | Field::U64(t, _) => t,
        Field::Begin(t) | Field::Close(t) => t,
        Field::End => wire::END,
    }
}

fn read_choice_field<'a>(
    r: &mut Reader<'a>,
    choice: &mut VersionChoice,
    field: Field<'a>,
) -> Result<(), FormatError> {
    match field {
        Field::Bytes(TAG_CHANGES, b) => choice.changes = wire::utf8(TAG_CHANGES, b)?,
        Field::Bytes(TAG_PAYLOAD_MIRROR, b) => {
            choice.mirrors.push(wire::utf8(TAG_PAYLOAD_MIRROR, b)?)
        }
        Field::Bytes(TAG_SHA256, b) => choice.sha256 = wire::fixed(TAG_SHA256, b)?,
        Field::Bytes(TAG_SIGNATURE, b) => choice.signature = Some(b.to_vec()),
        Field::Byte(TAG_RTF, v) => choice.rtf_changes = v != 0,
        Field::U32(TAG_INSTALLING_TO, v) => choice.installing_to = InstallingTo::from_bits_retain(v),
        Field::U64(TAG_SIZE, v) => choice.size = v,
        Field::Begin(CONFIG_CHANGE_BLOCK) => choice.sample_changes.push(read_config_change(r)?),
        other => r.skip(other)?,
    }
    Ok(())
}
