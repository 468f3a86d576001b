//! Client manifest (`IUCDFV2`): identity and state of the installed product.

use crate::codec::wire::{self, Field, MAGIC_LEN, Reader, Writer};
use crate::codec::{FormatError, Record};

const TAG_COMPANY: u8 = 0x01;
const TAG_PRODUCT: u8 = 0x02;
const TAG_GUID: u8 = 0x03;
const TAG_INSTALLED_VERSION: u8 = 0x04;
const TAG_SERVER_MIRROR: u8 = 0x05;
const TAG_PUBLIC_KEY: u8 = 0x07;
const TAG_CLOSE_ON_SUCCESS: u8 = 0xA1;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientManifest {
    pub company: String,
    pub product: String,
    /// Explicit product GUID; derived from the product name when unset.
    pub guid: Option<String>,
    pub installed_version: String,
    /// Mirrors of the server manifest, tried in order.
    pub server_mirrors: Vec<String>,
    /// Ed25519 verifying key. When present every payload must be signed.
    pub public_key: Option<[u8; 32]>,
    pub close_on_success: bool,
}

impl ClientManifest {
    /// Product GUID, falling back to a filesystem-safe form of the product name.
    pub fn guid(&self) -> String {
        match &self.guid {
            Some(guid) if !guid.is_empty() => guid.clone(),
            _ => self
                .product
                .chars()
                .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
                .collect(),
        }
    }
}

impl Record for ClientManifest {
    const NAME: &'static str = "client manifest";
    const MAGIC: &'static [u8; MAGIC_LEN] = b"IUCDFV2";

    fn write_body(&self, w: &mut Writer) {
        w.string(TAG_COMPANY, &self.company)
            .string(TAG_PRODUCT, &self.product)
            .opt_string(TAG_GUID, self.guid.as_deref())
            .string(TAG_INSTALLED_VERSION, &self.installed_version)
            .strings(TAG_SERVER_MIRROR, &self.server_mirrors)
            .flag(TAG_CLOSE_ON_SUCCESS, self.close_on_success);
        if let Some(key) = &self.public_key {
            w.bytes(TAG_PUBLIC_KEY, key);
        }
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, FormatError> {
        let mut out = Self::default();
        let mut have_version = false;
        loop {
            match r.next_field()? {
                Field::End => break,
                Field::Bytes(TAG_COMPANY, b) => out.company = wire::utf8(TAG_COMPANY, b)?,
                Field::Bytes(TAG_PRODUCT, b) => out.product = wire::utf8(TAG_PRODUCT, b)?,
                Field::Bytes(TAG_GUID, b) => out.guid = Some(wire::utf8(TAG_GUID, b)?),
                Field::Bytes(TAG_INSTALLED_VERSION, b) => {
                    out.installed_version = wire::utf8(TAG_INSTALLED_VERSION, b)?;
                    have_version = true;
                }
                Field::Bytes(TAG_SERVER_MIRROR, b) => {
                    out.server_mirrors.push(wire::utf8(TAG_SERVER_MIRROR, b)?)
                }
                Field::Bytes(TAG_PUBLIC_KEY, b) => {
                    out.public_key = Some(wire::fixed(TAG_PUBLIC_KEY, b)?)
                }
                Field::Byte(TAG_CLOSE_ON_SUCCESS, v) => out.close_on_success = v != 0,
                other => r.skip(other)?,
            }
        }
        if !have_version {
            return Err(FormatError::MissingField {
                record: Self::NAME,
                field: "installed version",
            });
        }
        Ok(out)
    }
}
