//! Payload wrapper codec
//!
//! Every file stored in the data file is prefixed with a 32-byte wrapper:
//! a type word, the decompressed size, and three Windows FILETIME-style
//! timestamps. Type 1 payloads are zlib streams; any other type carries
//! the payload verbatim.

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Cursor, Read, Write};
use tracing::trace;

use crate::error::{Error, Result};

/// Size of the wrapper header preceding each stored payload.
pub const WRAPPER_SIZE: usize = 32;

/// Wrapper type for zlib-compressed payloads.
pub const WRAPPER_TYPE_DEFLATE: u32 = 1;

/// Timestamp sentinel the writer stamps into all three time fields.
/// Readers ignore the timestamps; the constant is kept for compatibility
/// with archives the original client accepts.
pub const TIMESTAMP_SENTINEL: u64 = 0x01CA_8B14_A4E0_0000;

/// 32-byte header preceding each stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperHeader {
    /// Payload type (1 = zlib-compressed)
    pub kind: u32,
    /// Decompressed size in bytes
    pub raw_size: u32,
    /// Creation time, 100ns ticks (unused)
    pub created: u64,
    /// Modification time, 100ns ticks (unused)
    pub modified: u64,
    /// Access time, 100ns ticks (unused)
    pub accessed: u64,
}

impl WrapperHeader {
    /// Build the header the writer emits for a compressed payload.
    pub fn for_raw_size(raw_size: u32) -> Self {
        Self {
            kind: WRAPPER_TYPE_DEFLATE,
            raw_size,
            created: TIMESTAMP_SENTINEL,
            modified: TIMESTAMP_SENTINEL,
            accessed: TIMESTAMP_SENTINEL,
        }
    }

    /// Parse a wrapper header from the front of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < WRAPPER_SIZE {
            return Err(Error::CorruptWrapper(format!(
                "short wrapper: {} bytes (minimum {WRAPPER_SIZE})",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(Self {
            kind: cursor.read_u32::<LittleEndian>()?,
            raw_size: cursor.read_u32::<LittleEndian>()?,
            created: cursor.read_u64::<LittleEndian>()?,
            modified: cursor.read_u64::<LittleEndian>()?,
            accessed: cursor.read_u64::<LittleEndian>()?,
        })
    }

    /// Serialize the header to its on-disk form.
    pub fn to_bytes(&self) -> [u8; WRAPPER_SIZE] {
        let mut out = [0u8; WRAPPER_SIZE];
        out[0..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..8].copy_from_slice(&self.raw_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.created.to_le_bytes());
        out[16..24].copy_from_slice(&self.modified.to_le_bytes());
        out[24..32].copy_from_slice(&self.accessed.to_le_bytes());
        out
    }
}

fn compression_level(level: u32) -> Compression {
    match level {
        0 => Compression::none(),
        1 => Compression::fast(),
        2..=8 => Compression::new(level),
        9 => Compression::best(),
        _ => Compression::default(),
    }
}

/// Wrap raw bytes as `header || zlib(raw, level)`.
pub fn wrap(raw: &[u8], level: u32) -> Result<Vec<u8>> {
    let header = WrapperHeader::for_raw_size(raw.len() as u32);

    let mut out = Vec::with_capacity(WRAPPER_SIZE + raw.len() / 2);
    out.extend_from_slice(&header.to_bytes());

    let mut encoder = ZlibEncoder::new(out, compression_level(level));
    encoder.write_all(raw)?;
    let out = encoder.finish()?;

    trace!("wrapped {} bytes -> {} bytes", raw.len(), out.len());
    Ok(out)
}

/// Unwrap a stored payload back to its raw bytes.
///
/// Type 1 payloads are inflated and checked against the declared size
/// (a declared size of 0 disables the check). Any other type is returned
/// verbatim provided its length matches the declared size exactly.
pub fn unwrap(data: &[u8]) -> Result<Vec<u8>> {
    let header = WrapperHeader::parse(data)?;
    let body = &data[WRAPPER_SIZE..];

    if header.kind == WRAPPER_TYPE_DEFLATE {
        let mut decoder = ZlibDecoder::new(body);
        let mut raw = Vec::with_capacity(header.raw_size as usize);
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| Error::CorruptWrapper(format!("inflate failed: {e}")))?;

        if header.raw_size != 0 && raw.len() != header.raw_size as usize {
            return Err(Error::CorruptWrapper(format!(
                "declared size {} but inflated to {}",
                header.raw_size,
                raw.len()
            )));
        }

        trace!("unwrapped {} bytes -> {} bytes", data.len(), raw.len());
        Ok(raw)
    } else if body.len() == header.raw_size as usize {
        Ok(body.to_vec())
    } else {
        Err(Error::CorruptWrapper(format!(
            "type {} payload is {} bytes, declared {}",
            header.kind,
            body.len(),
            header.raw_size
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = WrapperHeader::for_raw_size(1234);
        let parsed = WrapperHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.kind, WRAPPER_TYPE_DEFLATE);
        assert_eq!(parsed.created, TIMESTAMP_SENTINEL);
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let raw = b"The quick brown fox jumps over the lazy dog".repeat(10);

        for level in [1, 6, 9] {
            let wrapped = wrap(&raw, level).unwrap();
            assert!(wrapped.len() > WRAPPER_SIZE);

            let header = WrapperHeader::parse(&wrapped).unwrap();
            assert_eq!(header.raw_size as usize, raw.len());

            assert_eq!(unwrap(&wrapped).unwrap(), raw);
        }
    }

    #[test]
    fn test_wrap_empty() {
        let wrapped = wrap(b"", 6).unwrap();
        assert_eq!(unwrap(&wrapped).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_unwrap_stored_passthrough() {
        // Type != 1 carries the payload verbatim
        let body = b"uncompressed payload";
        let mut data = Vec::new();
        let header = WrapperHeader {
            kind: 0,
            raw_size: body.len() as u32,
            created: 0,
            modified: 0,
            accessed: 0,
        };
        data.extend_from_slice(&header.to_bytes());
        data.extend_from_slice(body);

        assert_eq!(unwrap(&data).unwrap(), body);
    }

    #[test]
    fn test_unwrap_stored_size_mismatch() {
        let mut data = Vec::new();
        let header = WrapperHeader {
            kind: 0,
            raw_size: 999,
            created: 0,
            modified: 0,
            accessed: 0,
        };
        data.extend_from_slice(&header.to_bytes());
        data.extend_from_slice(b"short");

        assert!(matches!(unwrap(&data), Err(Error::CorruptWrapper(_))));
    }

    #[test]
    fn test_unwrap_short_header() {
        assert!(matches!(
            unwrap(&[0u8; 16]),
            Err(Error::CorruptWrapper(_))
        ));
    }

    #[test]
    fn test_unwrap_declared_size_mismatch() {
        let mut wrapped = wrap(b"hello world", 6).unwrap();
        // Tamper with the declared size
        wrapped[4..8].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(unwrap(&wrapped), Err(Error::CorruptWrapper(_))));
    }

    #[test]
    fn test_unwrap_garbage_body() {
        let mut data = Vec::new();
        data.extend_from_slice(&WrapperHeader::for_raw_size(100).to_bytes());
        data.extend_from_slice(&[0xAB; 40]);
        assert!(matches!(unwrap(&data), Err(Error::CorruptWrapper(_))));
    }
}
