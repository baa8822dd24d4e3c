//! Primitive tokens of the tagged binary stream.
//!
//! Integers are big-endian. Strings are a 4-byte length followed by the
//! payload. Tags are the bytes between `<` and `>`, with a leading `/` for
//! closing tags. Running out of input anywhere yields `Ok(None)`.

use byteorder::{BigEndian, ReadBytesExt};
use hx_core::{HxError, Result};
use std::io::{self, BufRead, BufReader, Read};

pub const MAX_TAG_LEN: usize = 256;
pub const MAX_STRING_LEN: u32 = 512 * 1024 * 1024; // 512 MiB

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub closing: bool,
}

impl Tag {
    pub fn open(name: &str) -> Self {
        Self { name: name.to_string(), closing: false }
    }

    pub fn close(name: &str) -> Self {
        Self { name: name.to_string(), closing: true }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.closing {
            write!(f, "</{}>", self.name)
        } else {
            write!(f, "<{}>", self.name)
        }
    }
}

/// Malformed token. The caller fills in its parser state.
pub(crate) fn malformed(expected: impl Into<String>, actual: impl Into<String>) -> HxError {
    HxError::Structural {
        state: String::new(),
        expected: expected.into(),
        actual: actual.into(),
    }
}

fn eof_as_none<T>(result: io::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(HxError::Io(e)),
    }
}

pub struct TokenReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> TokenReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: BufReader::new(inner) }
    }

    pub fn read_int32(&mut self) -> Result<Option<i32>> {
        eof_as_none(self.inner.read_i32::<BigEndian>())
    }

    pub fn read_int64(&mut self) -> Result<Option<i64>> {
        eof_as_none(self.inner.read_i64::<BigEndian>())
    }

    pub fn read_bool(&mut self) -> Result<Option<bool>> {
        Ok(eof_as_none(self.inner.read_u8())?.map(|b| b != 0))
    }

    pub fn read_string(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.read_int32()? else {
            return Ok(None);
        };
        if len < 0 || len as u32 > MAX_STRING_LEN {
            return Err(malformed("string length", len.to_string()));
        }
        let mut payload = Vec::new();
        let read = (&mut self.inner).take(len as u64).read_to_end(&mut payload)?;
        Ok((read == len as usize).then_some(payload))
    }

    /// Same framing as [`read_string`](Self::read_string); the payload is raw
    /// HTTP bytes.
    pub fn read_binstr(&mut self) -> Result<Option<Vec<u8>>> {
        self.read_string()
    }

    pub fn read_tag(&mut self) -> Result<Option<Tag>> {
        let Some(first) = eof_as_none(self.inner.read_u8())? else {
            return Ok(None);
        };
        if first != b'<' {
            return Err(malformed("<", format!("0x{first:02x}")));
        }
        let mut name = Vec::new();
        loop {
            let buf = match self.inner.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HxError::Io(e)),
            };
            if buf.is_empty() {
                return Ok(None);
            }
            match buf.iter().position(|&b| b == b'>') {
                Some(end) => {
                    name.extend_from_slice(&buf[..end]);
                    self.inner.consume(end + 1);
                    break;
                }
                None => {
                    let used = buf.len();
                    name.extend_from_slice(buf);
                    self.inner.consume(used);
                }
            }
            if name.len() > MAX_TAG_LEN {
                return Err(malformed(">", "overlong tag"));
            }
        }
        if name.len() > MAX_TAG_LEN {
            return Err(malformed(">", "overlong tag"));
        }
        let (closing, name) = match name.strip_prefix(b"/") {
            Some(rest) => (true, rest),
            None => (false, &name[..]),
        };
        Ok(Some(Tag {
            name: String::from_utf8_lossy(name).into_owned(),
            closing,
        }))
    }
}
