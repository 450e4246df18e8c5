//! SSH wire encoding of primitive data types (RFC 4251 Section 5).
//!
//! [`SshReader`] decodes from a borrowed buffer and checks every declared
//! length against both the remaining input and a configured ceiling before
//! anything is allocated. [`SshWrite`] adds the matching encoders to any
//! [`BufMut`].
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use kestrel_proto::ssh::wire::{SshReader, SshWrite};
//!
//! let mut buf = BytesMut::new();
//! buf.put_str("ssh-userauth");
//! buf.put_name_list(&["none", "password"]);
//!
//! let mut reader = SshReader::new(&buf);
//! assert_eq!(reader.read_utf8().unwrap(), "ssh-userauth");
//! assert_eq!(reader.read_name_list().unwrap(), vec!["none", "password"]);
//! ```

use bytes::BufMut;
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::BigInt;

/// Default ceiling for a single length-prefixed field.
pub const DEFAULT_MAX_FIELD_LEN: usize = 256 * 1024;

/// Cursor over an SSH-encoded buffer.
#[derive(Debug, Clone)]
pub struct SshReader<'a> {
    data: &'a [u8],
    offset: usize,
    max_field_len: usize,
}

impl<'a> SshReader<'a> {
    /// Creates a reader with the default field ceiling.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_limit(data, DEFAULT_MAX_FIELD_LEN)
    }

    /// Creates a reader that rejects any field declared longer than `max_field_len`.
    pub fn with_limit(data: &'a [u8], max_field_len: usize) -> Self {
        Self {
            data,
            offset: 0,
            max_field_len,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// True when all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns and consumes everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let data = self.data;
        let start = self.offset;
        self.offset = data.len();
        &data[start..]
    }

    fn take(&mut self, len: usize) -> KestrelResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(KestrelError::TruncatedInput {
                needed: len,
                available: self.remaining(),
            });
        }
        let data = self.data;
        let slice = &data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> KestrelResult<&'a [u8]> {
        self.take(len)
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self) -> KestrelResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a `boolean`; any non-zero value is true.
    pub fn read_bool(&mut self) -> KestrelResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian `uint16`.
    pub fn read_u16(&mut self) -> KestrelResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian `uint32`.
    pub fn read_u32(&mut self) -> KestrelResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian `uint64`.
    pub fn read_u64(&mut self) -> KestrelResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads an ssh `string` as raw bytes.
    pub fn read_string(&mut self) -> KestrelResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if len > self.max_field_len {
            return Err(KestrelError::Protocol(format!(
                "Field length {} exceeds limit {}",
                len, self.max_field_len
            )));
        }
        self.take(len)
    }

    /// Reads an ssh `string` that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> KestrelResult<String> {
        let bytes = self.read_string()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| KestrelError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads a `name-list`. An empty string yields an empty list.
    pub fn read_name_list(&mut self) -> KestrelResult<Vec<String>> {
        let bytes = self.read_string()?;
        let list = std::str::from_utf8(bytes)
            .map_err(|_| KestrelError::Protocol("Name-list contains invalid UTF-8".to_string()))?;

        if list.is_empty() {
            return Ok(Vec::new());
        }
        if !list.is_ascii() {
            return Err(KestrelError::Protocol(
                "Name-list contains non-ASCII characters".to_string(),
            ));
        }

        let names: Vec<String> = list.split(',').map(String::from).collect();
        if names.iter().any(|n| n.is_empty()) {
            return Err(KestrelError::Protocol(
                "Name-list contains an empty name".to_string(),
            ));
        }
        Ok(names)
    }

    /// Reads an `mpint` as a signed integer.
    pub fn read_mpint(&mut self) -> KestrelResult<BigInt> {
        let bytes = self.read_string()?;
        if bytes.is_empty() {
            return Ok(BigInt::from(0));
        }
        Ok(BigInt::from_signed_bytes_be(bytes))
    }

    /// Reads an `mpint` that must be non-negative and returns its magnitude
    /// without the sign-padding byte.
    pub fn read_mpint_unsigned(&mut self) -> KestrelResult<&'a [u8]> {
        let bytes = self.read_string()?;
        if let Some(&first) = bytes.first() {
            if first & 0x80 != 0 {
                return Err(KestrelError::Protocol(
                    "Negative mpint where unsigned value expected".to_string(),
                ));
            }
        }
        let start = bytes.iter().take_while(|&&b| b == 0).count();
        Ok(&bytes[start..])
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self) -> KestrelResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(KestrelError::Protocol(format!(
                "{} trailing bytes after message",
                self.remaining()
            )))
        }
    }
}

/// Encoders for SSH primitive types.
pub trait SshWrite {
    /// Writes a `boolean`.
    fn put_bool(&mut self, value: bool);

    /// Writes an ssh `string` from raw bytes.
    fn put_string(&mut self, value: &[u8]);

    /// Writes an ssh `string` from UTF-8 text.
    fn put_str(&mut self, value: &str) {
        self.put_string(value.as_bytes());
    }

    /// Writes a comma-separated `name-list`.
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]);

    /// Writes a signed integer as an `mpint`.
    fn put_mpint(&mut self, value: &BigInt);

    /// Writes a non-negative big-endian magnitude as an `mpint`.
    fn put_mpint_unsigned(&mut self, magnitude: &[u8]);
}

impl<B: BufMut> SshWrite for B {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_string(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }

    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined);
    }

    fn put_mpint(&mut self, value: &BigInt) {
        let encoded = mpint_bytes(value);
        self.put_string(&encoded);
    }

    fn put_mpint_unsigned(&mut self, magnitude: &[u8]) {
        let trimmed = &magnitude[magnitude.iter().take_while(|&&b| b == 0).count()..];
        if trimmed.is_empty() {
            self.put_u32(0);
            return;
        }
        if trimmed[0] & 0x80 != 0 {
            self.put_u32(trimmed.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(trimmed.len() as u32);
        }
        self.put_slice(trimmed);
    }
}

/// Minimal two's-complement body of an `mpint`, without the length prefix.
///
/// Zero encodes as an empty body.
pub fn mpint_bytes(value: &BigInt) -> Vec<u8> {
    if value.sign() == num_bigint::Sign::NoSign {
        return Vec::new();
    }
    value.to_signed_bytes_be()
}
