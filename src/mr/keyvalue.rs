//! Append-only store of opaque key/value pairs.
//!
//! Pairs live back to back in a single byte buffer, each framed as
//! `[key len: u32 LE][value len: u32 LE][key bytes][value bytes]`, so a store
//! can be shipped between processes as-is and re-validated on arrival.

use super::MrError;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyValue {
    buf: Vec<u8>,
    npairs: u64,
}

impl KeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        KeyValue {
            buf: Vec::with_capacity(bytes),
            npairs: 0,
        }
    }

    /// Rebuilds a store from a framed buffer, rejecting truncated or
    /// inconsistent framing.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, MrError> {
        let mut npairs = 0;
        let mut off = 0;
        while let Some((_, _, next)) = decode_at(&buf, off)? {
            npairs += 1;
            off = next;
        }
        Ok(KeyValue { buf, npairs })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), MrError> {
        let (Ok(klen), Ok(vlen)) = (u32::try_from(key.len()), u32::try_from(value.len())) else {
            return Err(MrError::PairTooLarge {
                key: key.len(),
                value: value.len(),
            });
        };
        self.buf.reserve(HEADER_LEN + key.len() + value.len());
        self.buf.extend_from_slice(&klen.to_le_bytes());
        self.buf.extend_from_slice(&vlen.to_le_bytes());
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(value);
        self.npairs += 1;
        Ok(())
    }

    /// Moves every pair of `other` to the end of this store.
    pub fn append(&mut self, other: KeyValue) {
        if self.buf.is_empty() {
            *self = other;
            return;
        }
        self.buf.extend_from_slice(&other.buf);
        self.npairs += other.npairs;
    }

    pub fn len(&self) -> u64 {
        self.npairs
    }

    pub fn is_empty(&self) -> bool {
        self.npairs == 0
    }

    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { buf: &self.buf, off: 0 }
    }
}

impl<'a> IntoIterator for &'a KeyValue {
    type Item = (&'a [u8], &'a [u8]);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Pairs of a store in append order.
pub struct Iter<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        // framing was validated when the buffer was built
        let (key, value, next) = decode_at(self.buf, self.off).ok()??;
        self.off = next;
        Some((key, value))
    }
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Decodes the pair starting at `off`; `Ok(None)` at the end of the buffer.
fn decode_at(buf: &[u8], off: usize) -> Result<Option<(&[u8], &[u8], usize)>, MrError> {
    if off == buf.len() {
        return Ok(None);
    }
    let truncated = |reason| MrError::MalformedBuffer { offset: off, reason };
    let klen = read_u32(buf, off).ok_or_else(|| truncated("truncated key length"))? as usize;
    let vlen = read_u32(buf, off + 4).ok_or_else(|| truncated("truncated value length"))? as usize;
    let key_start = off + HEADER_LEN;
    let value_start = key_start + klen;
    let end = value_start + vlen;
    let key = buf.get(key_start..value_start).ok_or_else(|| truncated("truncated key"))?;
    let value = buf.get(value_start..end).ok_or_else(|| truncated("truncated value"))?;
    Ok(Some((key, value, end)))
}
