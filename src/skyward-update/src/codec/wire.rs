//! Tagged field reader and writer.
//!
//! A record is a 7-byte magic followed by `(tag, payload)` fields and a
//! terminating [`END`] tag. The payload width is a function of the tag range,
//! so a reader can step over any field it does not understand:
//!
//! | tags          | payload                                   |
//! |---------------|-------------------------------------------|
//! | `0x01..=0x7F` | `u32` LE length, then that many bytes     |
//! | `0x80..=0x8F` | nested block, closed by `tag + 0x10`      |
//! | `0x90..=0x9F` | block close (no payload)                  |
//! | `0xA0..=0xBF` | 1 byte                                    |
//! | `0xC0..=0xDF` | 4 bytes LE                                |
//! | `0xE0..=0xFE` | 8 bytes LE                                |
//! | `0xFF`        | end of record                             |

use super::FormatError;

/// Length of the format-and-version magic.
pub const MAGIC_LEN: usize = 7;

/// End-of-record tag.
pub const END: u8 = 0xFF;

/// Offset between a block's opening tag and its closing tag.
pub const BLOCK_CLOSE_OFFSET: u8 = 0x10;

/// Deepest nesting of unknown blocks a reader will step over.
pub const MAX_DEPTH: usize = 64;

/// A single decoded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<'a> {
    Bytes(u8, &'a [u8]),
    Byte(u8, u8),
    U32(u8, u32),
    U64(u8, u64),
    /// Opening tag of a nested block.
    Begin(u8),
    /// Closing tag of a nested block.
    Close(u8),
    End,
}

/// Cursor over an encoded record.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Consume the magic, failing unless it is one of `expected`.
    pub fn magic(
        &mut self,
        expected: &[&'static [u8; MAGIC_LEN]],
    ) -> Result<&'static [u8; MAGIC_LEN], FormatError> {
        let found = self.take(MAGIC_LEN)?;
        expected
            .iter()
            .copied()
            .find(|m| m.as_slice() == found)
            .ok_or_else(|| FormatError::BadMagic {
                found: String::from_utf8_lossy(found).into_owned(),
            })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(FormatError::Truncated { offset: self.pos })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read the next field.
    pub fn next_field(&mut self) -> Result<Field<'a>, FormatError> {
        if self.pos >= self.buf.len() {
            return Err(FormatError::MissingEnd);
        }
        let tag = self.buf[self.pos];
        self.pos += 1;

        let field = match tag {
            0x00 => return Err(FormatError::ReservedTag { tag }),
            0x01..=0x7F => {
                let len = u32::from_le_bytes(self.array()?) as usize;
                Field::Bytes(tag, self.take(len)?)
            }
            0x80..=0x8F => Field::Begin(tag),
            0x90..=0x9F => Field::Close(tag),
            0xA0..=0xBF => Field::Byte(tag, self.array::<1>()?[0]),
            0xC0..=0xDF => Field::U32(tag, u32::from_le_bytes(self.array()?)),
            0xE0..=0xFE => Field::U64(tag, u64::from_le_bytes(self.array()?)),
            0xFF => Field::End,
        };
        Ok(field)
    }

    /// Step over a field the caller does not recognize.
    ///
    /// Unknown blocks are skipped along with everything nested in them, up
    /// to [`MAX_DEPTH`] levels; stray close or end tags are structural
    /// errors.
    pub fn skip(&mut self, field: Field<'a>) -> Result<(), FormatError> {
        match field {
            Field::Begin(tag) => self.skip_block(tag),
            Field::Close(tag) => Err(FormatError::UnexpectedClose { tag }),
            Field::End => Err(FormatError::UnexpectedClose { tag: END }),
            _ => Ok(()),
        }
    }

    fn skip_block(&mut self, begin: u8) -> Result<(), FormatError> {
        let mut open = vec![begin + BLOCK_CLOSE_OFFSET];
        while let Some(&close) = open.last() {
            match self.next_field()? {
                Field::Close(tag) if tag == close => {
                    open.pop();
                }
                Field::Begin(tag) => {
                    if open.len() >= MAX_DEPTH {
                        return Err(FormatError::TooDeep { offset: self.pos });
                    }
                    open.push(tag + BLOCK_CLOSE_OFFSET);
                }
                Field::Close(tag) => return Err(FormatError::UnexpectedClose { tag }),
                Field::End => return Err(FormatError::UnexpectedClose { tag: END }),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Builder for an encoded record.
#[derive(Debug)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(magic: &[u8; MAGIC_LEN]) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(magic);
        Self { buf }
    }

    pub fn bytes(&mut self, tag: u8, data: &[u8]) -> &mut Self {
        debug_assert!((0x01..=0x7F).contains(&tag));
        debug_assert!(data.len() <= u32::MAX as usize);
        self.buf.push(tag);
        self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    pub fn string(&mut self, tag: u8, value: &str) -> &mut Self {
        self.bytes(tag, value.as_bytes())
    }

    pub fn opt_string(&mut self, tag: u8, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.string(tag, value);
        }
        self
    }

    /// One length-prefixed field per item.
    pub fn strings<S: AsRef<str>>(&mut self, tag: u8, values: &[S]) -> &mut Self {
        for value in values {
            self.string(tag, value.as_ref());
        }
        self
    }

    pub fn byte(&mut self, tag: u8, value: u8) -> &mut Self {
        debug_assert!((0xA0..=0xBF).contains(&tag));
        self.buf.push(tag);
        self.buf.push(value);
        self
    }

    /// Booleans are only written when set.
    pub fn flag(&mut self, tag: u8, value: bool) -> &mut Self {
        if value {
            self.byte(tag, 1);
        }
        self
    }

    pub fn u32(&mut self, tag: u8, value: u32) -> &mut Self {
        debug_assert!((0xC0..=0xDF).contains(&tag));
        self.buf.push(tag);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, tag: u8, value: u64) -> &mut Self {
        debug_assert!((0xE0..=0xFE).contains(&tag));
        self.buf.push(tag);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write `tag`, the fields produced by `body`, then the matching close tag.
    pub fn block(&mut self, tag: u8, body: impl FnOnce(&mut Writer)) -> &mut Self {
        debug_assert!((0x80..=0x8F).contains(&tag));
        self.buf.push(tag);
        body(self);
        self.buf.push(tag + BLOCK_CLOSE_OFFSET);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(END);
        self.buf
    }
}

/// Decode a UTF-8 string payload.
pub fn utf8(tag: u8, bytes: &[u8]) -> Result<String, FormatError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8 { tag })
}

/// Decode a fixed-width byte array payload.
pub fn fixed<const N: usize>(tag: u8, bytes: &[u8]) -> Result<[u8; N], FormatError> {
    <[u8; N]>::try_from(bytes).map_err(|_| FormatError::BadLength {
        tag,
        len: bytes.len(),
        expected: N,
    })
}
