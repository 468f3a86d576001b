//! Transparent unwrapping of manifests shipped inside an archive.

use std::borrow::Cow;
use std::io::{Cursor, Read};

use flate2::read::GzDecoder;

use super::FormatError;

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Largest record a container may expand to.
pub const MAX_RECORD_LEN: u64 = 16 * 1024 * 1024;

/// Return the record bytes, decompressing a gzip stream or taking the first
/// file of a zip archive when the input starts with the container's magic.
pub fn unwrap_container(bytes: &[u8]) -> Result<Cow<'_, [u8]>, FormatError> {
    unwrap_bounded(bytes, MAX_RECORD_LEN)
}

fn unwrap_bounded(bytes: &[u8], limit: u64) -> Result<Cow<'_, [u8]>, FormatError> {
    if bytes.starts_with(GZIP_MAGIC) {
        let out = read_bounded(GzDecoder::new(bytes), 0, limit, "gzip")?;
        return Ok(Cow::Owned(out));
    }

    if bytes.starts_with(ZIP_MAGIC) {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| FormatError::Container(format!("zip: {e}")))?;
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .map_err(|e| FormatError::Container(format!("zip: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let declared = entry.size();
            return read_bounded(entry, declared, limit, "zip").map(Cow::Owned);
        }
        return Err(FormatError::Container("zip archive holds no file".to_string()));
    }

    Ok(Cow::Borrowed(bytes))
}

/// Read at most `limit` bytes, failing when the stream holds more.
fn read_bounded(
    reader: impl Read,
    size_hint: u64,
    limit: u64,
    kind: &str,
) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(size_hint.min(limit) as usize);
    reader
        .take(limit + 1)
        .read_to_end(&mut out)
        .map_err(|e| FormatError::Container(format!("{kind}: {e}")))?;
    if out.len() as u64 > limit {
        return Err(FormatError::Container(format!(
            "{kind}: record larger than {limit} bytes"
        )));
    }
    Ok(out)
}
