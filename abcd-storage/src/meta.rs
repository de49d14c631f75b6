//! Meta table
//!
//! Channel 2 holds one fixed 16-byte record per directory entry, locating
//! the entry's payload in the data file.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

/// Size of one meta record.
pub const META_RECORD_SIZE: usize = 16;

/// Flag bit 0: payload is compressed.
pub const META_FLAG_COMPRESSED: u32 = 1;

/// One meta record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaRecord {
    pub flags: u32,
    /// Wrapped payload size in bytes; 0 = directory node or placeholder
    pub size: u32,
    pub start_block: u32,
    /// Reserved; preserved on patch, never interpreted
    pub extra: u32,
}

impl MetaRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < META_RECORD_SIZE {
            return Err(Error::InconsistentArchive(format!(
                "truncated meta record: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            flags: cursor.read_u32::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
            start_block: cursor.read_u32::<LittleEndian>()?,
            extra: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; META_RECORD_SIZE] {
        let mut out = [0u8; META_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.start_block.to_le_bytes());
        out[12..16].copy_from_slice(&self.extra.to_le_bytes());
        out
    }

    /// True when the record addresses a stored payload.
    pub fn has_payload(&self) -> bool {
        self.size > 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & META_FLAG_COMPRESSED != 0
    }
}

/// Parsed meta channel
pub struct MetaTable {
    records: Vec<MetaRecord>,
}

impl MetaTable {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut records = Vec::with_capacity(data.len() / META_RECORD_SIZE);
        for chunk in data.chunks_exact(META_RECORD_SIZE) {
            records.push(MetaRecord::parse(chunk)?);
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, index: u32) -> Option<&MetaRecord> {
        self.records.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let record = MetaRecord {
            flags: META_FLAG_COMPRESSED,
            size: 1543,
            start_block: 7,
            extra: 0,
        };
        let parsed = MetaRecord::parse(&record.to_bytes()).unwrap();
        assert_eq!(parsed, record);
        assert!(parsed.has_payload());
        assert!(parsed.is_compressed());
    }

    #[test]
    fn test_placeholder_record() {
        let record = MetaRecord {
            flags: 0,
            size: 0,
            start_block: 0,
            extra: 0,
        };
        assert!(!record.has_payload());
        assert!(!record.is_compressed());
    }

    #[test]
    fn test_table_parse() {
        let mut data = Vec::new();
        for i in 0..3u32 {
            data.extend_from_slice(
                &MetaRecord {
                    flags: 1,
                    size: 100 + i,
                    start_block: i + 1,
                    extra: 0,
                }
                .to_bytes(),
            );
        }
        let table = MetaTable::parse(&data).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.record(2).unwrap().size, 102);
        assert!(table.record(3).is_none());
    }
}
