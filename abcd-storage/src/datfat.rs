//! Block store: the data file and its allocation table
//!
//! The data file is a flat run of 512-byte blocks; block 0 is reserved and
//! zero-filled. Channel 3 of the index file holds one 32-bit word per
//! block: the successor block, or `0xFFFF_FFFF` at the end of a chain.
//! Writers only ever append whole, zero-padded files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Size of one data-file block.
pub const BLOCK_SIZE: usize = 512;

/// FAT word terminating a chain.
pub const FAT_END_OF_CHAIN: u32 = 0xFFFF_FFFF;

/// Pending writes are flushed once this many bytes accumulate.
pub const FLUSH_THRESHOLD: usize = 8 * 1024 * 1024;

/// Parsed file-allocation table
pub struct Fat {
    entries: Vec<u32>,
}

impl Fat {
    /// Parse the FAT channel buffer (little-endian 32-bit words).
    pub fn parse(data: &[u8]) -> Self {
        let entries = data
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, block: u32) -> Option<u32> {
        self.entries.get(block as usize).copied()
    }

    /// Collect the block chain for a payload of `size` bytes starting at
    /// `start_block`. The chain must run exactly `ceil(size / 512)` blocks
    /// and close with the end-of-chain word.
    pub fn chain(&self, start_block: u32, size: u32) -> Result<Vec<u32>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        if start_block == 0 || start_block >= self.len() {
            return Err(Error::InvalidStartBlock(start_block));
        }

        let expected = (size as u64).div_ceil(BLOCK_SIZE as u64) as usize;
        let mut blocks = Vec::with_capacity(expected);
        let mut block = start_block;

        loop {
            blocks.push(block);
            if blocks.len() == expected {
                break;
            }
            let next = self
                .entry(block)
                .ok_or(Error::UnexpectedEndOfChain(block))?;
            if next == FAT_END_OF_CHAIN || next == 0 || next >= self.len() {
                return Err(Error::UnexpectedEndOfChain(block));
            }
            block = next;
        }

        // The final block must close the chain
        match self.entry(block) {
            Some(FAT_END_OF_CHAIN) => Ok(blocks),
            _ => Err(Error::UnexpectedEndOfChain(block)),
        }
    }
}

/// Read one wrapped payload out of the data file.
pub fn read_payload<R: Read + Seek>(
    dat: &mut R,
    fat: &Fat,
    start_block: u32,
    size: u32,
) -> Result<Vec<u8>> {
    let blocks = fat.chain(start_block, size)?;
    let mut out = Vec::with_capacity(size as usize);
    let mut remaining = size as usize;

    for block in blocks {
        let take = remaining.min(BLOCK_SIZE);
        let mut buf = vec![0u8; take];
        dat.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        dat.read_exact(&mut buf).map_err(|_| Error::ShortRead {
            block,
            expected: take,
            actual: 0,
        })?;
        out.extend_from_slice(&buf);
        remaining -= take;
    }

    trace!(
        "read payload: start_block={}, size={}, blocks={}",
        start_block,
        size,
        (size as usize).div_ceil(BLOCK_SIZE)
    );
    Ok(out)
}

/// Append-only data-file writer with write coalescing
///
/// Files are appended one at a time; each occupies a run of consecutive
/// blocks, zero-padded to a block multiple, with FAT words chained across
/// the run and closed with the end-of-chain marker.
pub struct DatWriter {
    file: File,
    pending: Vec<u8>,
    next_block: u32,
    fat_entries: Vec<u32>,
}

impl DatWriter {
    /// Create a fresh data file with the reserved zero block 0.
    pub fn create(path: &Path) -> Result<Self> {
        debug!("creating data file: {:?}", path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            pending: vec![0u8; BLOCK_SIZE],
            next_block: 1,
            fat_entries: vec![0],
        })
    }

    /// Append one wrapped payload; returns `(start_block, block_count)`.
    pub fn append(&mut self, wrapped: &[u8]) -> Result<(u32, u32)> {
        let block_count = wrapped.len().div_ceil(BLOCK_SIZE) as u32;
        let start_block = self.next_block;

        self.pending.extend_from_slice(wrapped);
        let padding = block_count as usize * BLOCK_SIZE - wrapped.len();
        self.pending.extend_from_slice(&vec![0u8; padding]);

        for i in 0..block_count {
            let last = i + 1 == block_count;
            self.fat_entries.push(if last {
                FAT_END_OF_CHAIN
            } else {
                start_block + i + 1
            });
        }
        self.next_block += block_count;

        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush_pending()?;
        }

        Ok((start_block, block_count))
    }

    fn flush_pending(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.file.write_all(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }

    /// Total blocks written or pending.
    pub fn block_count(&self) -> u32 {
        self.next_block
    }

    /// Flush everything and hand back the FAT word sequence.
    pub fn finish(mut self) -> Result<Vec<u32>> {
        self.flush_pending()?;
        self.file.sync_all()?;
        Ok(self.fat_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fat_from(words: &[u32]) -> Fat {
        let mut data = Vec::new();
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        Fat::parse(&data)
    }

    #[test]
    fn test_chain_single_block() {
        let fat = fat_from(&[0, FAT_END_OF_CHAIN]);
        assert_eq!(fat.chain(1, 100).unwrap(), vec![1]);
    }

    #[test]
    fn test_chain_multi_block() {
        let fat = fat_from(&[0, 2, 3, FAT_END_OF_CHAIN]);
        assert_eq!(fat.chain(1, 1200).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_chain_rejects_block_zero() {
        let fat = fat_from(&[0, FAT_END_OF_CHAIN]);
        assert!(matches!(fat.chain(0, 10), Err(Error::InvalidStartBlock(0))));
    }

    #[test]
    fn test_chain_rejects_out_of_range_start() {
        let fat = fat_from(&[0, FAT_END_OF_CHAIN]);
        assert!(matches!(
            fat.chain(9, 10),
            Err(Error::InvalidStartBlock(9))
        ));
    }

    #[test]
    fn test_chain_too_short() {
        // Chain ends after one block but the size needs two
        let fat = fat_from(&[0, FAT_END_OF_CHAIN, FAT_END_OF_CHAIN]);
        assert!(matches!(
            fat.chain(1, 1000),
            Err(Error::UnexpectedEndOfChain(1))
        ));
    }

    #[test]
    fn test_chain_unterminated() {
        // Size says one block but the FAT continues
        let fat = fat_from(&[0, 2, FAT_END_OF_CHAIN]);
        assert!(matches!(
            fat.chain(1, 100),
            Err(Error::UnexpectedEndOfChain(1))
        ));
    }

    #[test]
    fn test_zero_size_has_no_chain() {
        let fat = fat_from(&[0, FAT_END_OF_CHAIN]);
        assert_eq!(fat.chain(1, 0).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_read_payload() {
        let fat = fat_from(&[0, 2, FAT_END_OF_CHAIN]);
        let mut dat = vec![0u8; 3 * BLOCK_SIZE];
        for (i, byte) in dat[BLOCK_SIZE..].iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
        let mut reader = Cursor::new(dat.clone());

        let payload = read_payload(&mut reader, &fat, 1, 700).unwrap();
        assert_eq!(payload.len(), 700);
        assert_eq!(payload[..], dat[BLOCK_SIZE..BLOCK_SIZE + 700]);
    }

    #[test]
    fn test_read_payload_short_file() {
        let fat = fat_from(&[0, 2, FAT_END_OF_CHAIN]);
        // File only holds two blocks; block 2 is truncated
        let mut reader = Cursor::new(vec![0u8; 2 * BLOCK_SIZE + 10]);
        assert!(matches!(
            read_payload(&mut reader, &fat, 1, 700),
            Err(Error::ShortRead { block: 2, .. })
        ));
    }

    #[test]
    fn test_writer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dat");

        let mut writer = DatWriter::create(&path).unwrap();
        let (start_a, blocks_a) = writer.append(&[0xAAu8; 100]).unwrap();
        let (start_b, blocks_b) = writer.append(&[0xBBu8; 1000]).unwrap();
        assert_eq!((start_a, blocks_a), (1, 1));
        assert_eq!((start_b, blocks_b), (2, 2));
        assert_eq!(writer.block_count(), 4);

        let fat_entries = writer.finish().unwrap();
        assert_eq!(
            fat_entries,
            vec![0, FAT_END_OF_CHAIN, 3, FAT_END_OF_CHAIN]
        );

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 4 * BLOCK_SIZE);
        // Reserved block 0 is zero-filled
        assert!(data[..BLOCK_SIZE].iter().all(|&b| b == 0));
        assert_eq!(data[BLOCK_SIZE], 0xAA);
        // Padding after the first payload is zeroed
        assert_eq!(data[BLOCK_SIZE + 100], 0);
        assert_eq!(data[2 * BLOCK_SIZE], 0xBB);

        // Read back through the FAT
        let fat = fat_from(&fat_entries);
        let mut reader = Cursor::new(data);
        assert_eq!(
            read_payload(&mut reader, &fat, start_b, 1000).unwrap(),
            vec![0xBBu8; 1000]
        );
    }
}
