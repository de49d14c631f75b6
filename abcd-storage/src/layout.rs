//! Striped page layout of the index file
//!
//! The index file interleaves four logical byte streams ("channels") over
//! a grid of fixed-size pages. Physical page 0 holds the header; after it
//! the pages repeat in stripes, each stripe granting every channel its
//! declared page allotment. The page size itself is not stored and has to
//! be inferred from the file length.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use tracing::debug;

use crate::error::{Error, Result};

/// Magic bytes at the start of the index file.
pub const IDX_MAGIC: [u8; 4] = *b"ABCD";

/// Number of channels carried by the index file.
pub const CHANNEL_COUNT: usize = 4;

/// Per-stripe page allotment written by the repacker.
pub const DEFAULT_PAGES_PER_STRIPE: [u32; CHANNEL_COUNT] = [4, 8, 1, 4];

/// Page size written by the repacker.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Size of the channel header at the start of the header page.
pub const IDX_HEADER_SIZE: usize = 8 + CHANNEL_COUNT * 8;

/// Channel indices, in on-disk order.
pub const CHANNEL_TRIE: usize = 0;
pub const CHANNEL_STRINGS: usize = 1;
pub const CHANNEL_META: usize = 2;
pub const CHANNEL_FAT: usize = 3;

/// Page sizes the reader will consider when opening an index file.
const PAGE_SIZE_CANDIDATES: [u64; 7] = [512, 1024, 2048, 4096, 8192, 16384, 32768];

/// One channel's declaration from the index header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDesc {
    /// Pages granted to this channel per stripe
    pub pages_per_stripe: u32,
    /// Logical length of the channel in bytes
    pub size_bytes: u32,
}

/// Parsed geometry of an index file
#[derive(Debug, Clone)]
pub struct IndexLayout {
    page_size: u64,
    channels: [ChannelDesc; CHANNEL_COUNT],
    /// Pages per full stripe (sum over channels)
    stripe_pages: u64,
    /// Page offset of each channel within a stripe (prefix sums)
    prefix_pages: [u64; CHANNEL_COUNT],
    /// Number of stripes in the file
    stripes: u64,
    file_len: u64,
}

fn parse_channels(header: &[u8]) -> Result<[ChannelDesc; CHANNEL_COUNT]> {
    if header.len() < IDX_HEADER_SIZE {
        return Err(Error::UnrecognizedLayout(format!(
            "header too short: {} bytes",
            header.len()
        )));
    }
    if header[0..4] != IDX_MAGIC {
        return Err(Error::UnrecognizedLayout(format!(
            "bad magic {:02x?}",
            &header[0..4]
        )));
    }

    let mut cursor = Cursor::new(&header[4..]);
    let channel_count = cursor.read_u32::<LittleEndian>()?;
    if channel_count as usize != CHANNEL_COUNT {
        return Err(Error::UnrecognizedLayout(format!(
            "unexpected channel count {channel_count}"
        )));
    }

    let mut channels = [ChannelDesc {
        pages_per_stripe: 0,
        size_bytes: 0,
    }; CHANNEL_COUNT];
    for channel in channels.iter_mut() {
        channel.pages_per_stripe = cursor.read_u32::<LittleEndian>()?;
        channel.size_bytes = cursor.read_u32::<LittleEndian>()?;
        if channel.pages_per_stripe == 0 {
            return Err(Error::UnrecognizedLayout(
                "channel with zero pages per stripe".into(),
            ));
        }
    }

    Ok(channels)
}

impl IndexLayout {
    /// Parse the channel header and infer the page size from the file length.
    ///
    /// Of the candidate sizes, a survivor must divide the file length
    /// evenly, leave at least two pages, close an integral number of
    /// stripes, and give every channel enough pages for its declared
    /// length. 4096 wins among survivors, else the smallest.
    pub fn parse(header: &[u8], file_len: u64) -> Result<Self> {
        let channels = parse_channels(header)?;
        let stripe_pages: u64 = channels.iter().map(|c| c.pages_per_stripe as u64).sum();

        let mut survivor: Option<u64> = None;
        for &page_size in &PAGE_SIZE_CANDIDATES {
            if file_len % page_size != 0 {
                continue;
            }
            let total_pages = file_len / page_size;
            if total_pages < 2 || (total_pages - 1) % stripe_pages != 0 {
                continue;
            }
            let stripes = (total_pages - 1) / stripe_pages;
            let fits = channels.iter().all(|c| {
                let pages_needed = (c.size_bytes as u64).div_ceil(page_size);
                pages_needed <= stripes * c.pages_per_stripe as u64
            });
            if !fits {
                continue;
            }
            if page_size == DEFAULT_PAGE_SIZE {
                survivor = Some(page_size);
                break;
            }
            survivor.get_or_insert(page_size);
        }

        let page_size = survivor.ok_or_else(|| {
            Error::UnrecognizedLayout(format!("no page size fits a {file_len}-byte file"))
        })?;

        debug!(
            "index layout: page_size={}, stripe={} pages, channels={:?}",
            page_size, stripe_pages, channels
        );

        Ok(Self::with_geometry(page_size, channels, file_len))
    }

    /// Build the layout the repacker emits: default page size and stripe
    /// vector, just enough stripes for every channel.
    pub fn for_build(channel_sizes: [u32; CHANNEL_COUNT]) -> Self {
        let page_size = DEFAULT_PAGE_SIZE;
        let mut channels = [ChannelDesc {
            pages_per_stripe: 0,
            size_bytes: 0,
        }; CHANNEL_COUNT];
        let mut stripes = 1u64;
        for (c, channel) in channels.iter_mut().enumerate() {
            channel.pages_per_stripe = DEFAULT_PAGES_PER_STRIPE[c];
            channel.size_bytes = channel_sizes[c];
            let pages_needed = (channel_sizes[c] as u64).div_ceil(page_size);
            stripes = stripes.max(pages_needed.div_ceil(channel.pages_per_stripe as u64));
        }

        let stripe_pages: u64 = DEFAULT_PAGES_PER_STRIPE.iter().map(|&p| p as u64).sum();
        let file_len = (1 + stripes * stripe_pages) * page_size;
        Self::with_geometry(page_size, channels, file_len)
    }

    fn with_geometry(
        page_size: u64,
        channels: [ChannelDesc; CHANNEL_COUNT],
        file_len: u64,
    ) -> Self {
        let stripe_pages: u64 = channels.iter().map(|c| c.pages_per_stripe as u64).sum();
        let mut prefix_pages = [0u64; CHANNEL_COUNT];
        for c in 1..CHANNEL_COUNT {
            prefix_pages[c] = prefix_pages[c - 1] + channels[c - 1].pages_per_stripe as u64;
        }
        let stripes = (file_len / page_size - 1) / stripe_pages;

        Self {
            page_size,
            channels,
            stripe_pages,
            prefix_pages,
            stripes,
            file_len,
        }
    }

    /// Serialize the channel header for the header page.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDX_HEADER_SIZE);
        out.extend_from_slice(&IDX_MAGIC);
        out.extend_from_slice(&(CHANNEL_COUNT as u32).to_le_bytes());
        for channel in &self.channels {
            out.extend_from_slice(&channel.pages_per_stripe.to_le_bytes());
            out.extend_from_slice(&channel.size_bytes.to_le_bytes());
        }
        out
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn stripes(&self) -> u64 {
        self.stripes
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn channel(&self, c: usize) -> &ChannelDesc {
        &self.channels[c]
    }

    /// Total bytes the file grants channel `c`, used or not.
    pub fn channel_capacity(&self, c: usize) -> u64 {
        self.stripes * self.channels[c].pages_per_stripe as u64 * self.page_size
    }

    /// File-offset of the `size_bytes` header field for channel `c`.
    pub fn channel_size_field_offset(c: usize) -> u64 {
        8 + c as u64 * 8 + 4
    }

    /// Map a logical byte offset within channel `c` to its file offset.
    pub fn channel_to_file_offset(&self, c: usize, off: u64) -> u64 {
        let pps = self.channels[c].pages_per_stripe as u64;
        let logical_page = off / self.page_size;
        let within = off % self.page_size;
        let stripe = logical_page / pps;
        let physical_page =
            1 + stripe * self.stripe_pages + self.prefix_pages[c] + logical_page % pps;
        physical_page * self.page_size + within
    }

    /// Materialize channel `c` as one contiguous buffer of `size_bytes`.
    pub fn read_channel<R: Read + Seek>(&self, reader: &mut R, c: usize) -> Result<Vec<u8>> {
        let size = self.channels[c].size_bytes as u64;
        let mut out = vec![0u8; size as usize];

        let mut off = 0u64;
        while off < size {
            let take = (size - off).min(self.page_size - off % self.page_size);
            reader.seek(SeekFrom::Start(self.channel_to_file_offset(c, off)))?;
            reader.read_exact(&mut out[off as usize..(off + take) as usize])?;
            off += take;
        }

        Ok(out)
    }

    /// Scatter `data` into channel `c` starting at logical offset `off`.
    /// Each write segment stays within one logical page. The caller is
    /// responsible for the durability barrier.
    pub fn write_channel_bytes<W: Write + Seek>(
        &self,
        writer: &mut W,
        c: usize,
        off: u64,
        data: &[u8],
    ) -> Result<()> {
        if off + data.len() as u64 > self.channel_capacity(c) {
            return Err(Error::CapacityExceeded(format!(
                "write of {} bytes at {} exceeds channel {} capacity {}",
                data.len(),
                off,
                c,
                self.channel_capacity(c)
            )));
        }

        let mut done = 0usize;
        let mut off = off;
        while done < data.len() {
            let take =
                (data.len() - done).min((self.page_size - off % self.page_size) as usize);
            writer.seek(SeekFrom::Start(self.channel_to_file_offset(c, off)))?;
            writer.write_all(&data[done..done + take])?;
            done += take;
            off += take as u64;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_header(channels: &[(u32, u32)]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&IDX_MAGIC);
        header.extend_from_slice(&(channels.len() as u32).to_le_bytes());
        for &(pps, size) in channels {
            header.extend_from_slice(&pps.to_le_bytes());
            header.extend_from_slice(&size.to_le_bytes());
        }
        header
    }

    fn default_header(sizes: [u32; 4]) -> Vec<u8> {
        build_header(&[
            (4, sizes[0]),
            (8, sizes[1]),
            (1, sizes[2]),
            (4, sizes[3]),
        ])
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut header = default_header([20, 64, 16, 8]);
        header[0] = b'X';
        let err = IndexLayout::parse(&header, (1 + 17) * 4096).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedLayout(_)));
    }

    #[test]
    fn test_rejects_bad_channel_count() {
        let header = build_header(&[(4, 0), (8, 0), (1, 0)]);
        assert!(matches!(
            IndexLayout::parse(&header, (1 + 13) * 4096),
            Err(Error::UnrecognizedLayout(_))
        ));
    }

    #[test]
    fn test_infers_default_page_size() {
        let header = default_header([20, 64, 16, 8]);
        let layout = IndexLayout::parse(&header, (1 + 17) * 4096).unwrap();
        assert_eq!(layout.page_size(), 4096);
        assert_eq!(layout.stripes(), 1);
    }

    #[test]
    fn test_rejects_impossible_length() {
        let header = default_header([20, 64, 16, 8]);
        // Not a multiple of any candidate page count that closes a stripe
        assert!(matches!(
            IndexLayout::parse(&header, 4096 * 5),
            Err(Error::UnrecognizedLayout(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_channel() {
        // Channel 2 gets 1 page per stripe; one stripe cannot hold 2 pages
        let header = default_header([20, 64, 5000, 8]);
        assert!(matches!(
            IndexLayout::parse(&header, (1 + 17) * 4096),
            Err(Error::UnrecognizedLayout(_))
        ));
        // Two stripes can
        let layout = IndexLayout::parse(&header, (1 + 2 * 17) * 4096).unwrap();
        assert_eq!(layout.stripes(), 2);
    }

    #[test]
    fn test_offset_mapping() {
        let header = default_header([20000, 64, 16, 8]);
        let layout = IndexLayout::parse(&header, (1 + 2 * 17) * 4096).unwrap();

        // Channel 0 page 0 sits right after the header page
        assert_eq!(layout.channel_to_file_offset(0, 0), 4096);
        assert_eq!(layout.channel_to_file_offset(0, 10), 4106);
        // Pages 0..4 of channel 0 are contiguous within the first stripe
        assert_eq!(layout.channel_to_file_offset(0, 3 * 4096), 4 * 4096);
        // Page 4 wraps into the second stripe
        assert_eq!(
            layout.channel_to_file_offset(0, 4 * 4096),
            (1 + 17) * 4096
        );
        // Channel 1 starts after channel 0's allotment
        assert_eq!(layout.channel_to_file_offset(1, 0), 5 * 4096);
        // Channel 3 starts after channels 0..2
        assert_eq!(layout.channel_to_file_offset(3, 0), (1 + 13) * 4096);
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        // Property: write_channel_bytes followed by read_channel agrees on
        // the written range, including page-boundary straddles.
        let size: u32 = 4 * 4096;
        let header = default_header([size, 64, 16, 8]);
        let file_len = (1 + 17) * 4096;
        let layout = IndexLayout::parse(&header, file_len).unwrap();

        let mut file = Cursor::new(vec![0u8; file_len as usize]);
        let data: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
        let off = 4000u64; // straddles several page boundaries
        layout.write_channel_bytes(&mut file, 0, off, &data).unwrap();

        let channel = layout.read_channel(&mut file, 0).unwrap();
        assert_eq!(
            &channel[off as usize..off as usize + data.len()],
            &data[..]
        );
    }

    #[test]
    fn test_write_rejects_over_capacity() {
        let header = default_header([16, 64, 16, 8]);
        let layout = IndexLayout::parse(&header, (1 + 17) * 4096).unwrap();
        let mut file = Cursor::new(vec![0u8; (1 + 17) * 4096]);
        let data = vec![0u8; 4096];
        let err = layout
            .write_channel_bytes(&mut file, 2, 4000, &data)
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
    }

    #[test]
    fn test_for_build_geometry() {
        let layout = IndexLayout::for_build([20, 64, 16, 8]);
        assert_eq!(layout.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(layout.stripes(), 1);
        assert_eq!(layout.file_len(), (1 + 17) * 4096);

        // Round-trip through parse
        let reparsed = IndexLayout::parse(&layout.header_bytes(), layout.file_len()).unwrap();
        assert_eq!(reparsed.page_size(), layout.page_size());
        assert_eq!(reparsed.channel(1), layout.channel(1));
    }

    #[test]
    fn test_for_build_scales_stripes() {
        // Channel 2 (1 page per stripe) forces the stripe count
        let layout = IndexLayout::for_build([20, 64, 3 * 4096 + 1, 8]);
        assert_eq!(layout.stripes(), 4);
        assert_eq!(layout.file_len(), (1 + 4 * 17) * 4096);
    }

    #[test]
    fn test_size_field_offset() {
        assert_eq!(IndexLayout::channel_size_field_offset(0), 12);
        assert_eq!(IndexLayout::channel_size_field_offset(3), 36);
    }
}
