//! Archive facade
//!
//! Ties the index channels and the data file together behind one handle:
//! entry iteration, key lookup, and payload reads. Channel buffers are
//! immutable once loaded; the data file is opened lazily and
//! memory-mapped when possible.

use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::datfat::{read_payload, Fat};
use crate::error::{Error, Result};
use crate::layout::{IndexLayout, CHANNEL_FAT, CHANNEL_META, CHANNEL_STRINGS, CHANNEL_TRIE};
use crate::meta::{MetaRecord, MetaTable};
use crate::strings::StringReader;
use crate::trie::{DirectoryTrie, DtNode};
use crate::wrapper;

/// Archives larger than this are never memory-mapped.
const MMAP_LIMIT: u64 = 2_147_483_648;

/// Data-file reader: memory-mapped when possible, buffered otherwise
enum DatReader {
    Mapped(Cursor<Mmap>),
    Buffered(BufReader<File>),
}

impl DatReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        if size > 0 && size < MMAP_LIMIT {
            match unsafe { MmapOptions::new().map(&file) } {
                Ok(mmap) => {
                    debug!("memory-mapped data file: {:?} ({} bytes)", path, size);
                    return Ok(Self::Mapped(Cursor::new(mmap)));
                }
                Err(e) => {
                    debug!("mmap failed for {:?}, using buffered reads: {}", path, e);
                }
            }
        }

        Ok(Self::Buffered(BufReader::new(file)))
    }
}

impl Read for DatReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Mapped(cursor) => cursor.read(buf),
            Self::Buffered(reader) => reader.read(buf),
        }
    }
}

impl Seek for DatReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::Mapped(cursor) => cursor.seek(pos),
            Self::Buffered(reader) => reader.seek(pos),
        }
    }
}

/// One listed directory entry
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub node_index: u32,
    pub meta_index: u32,
    /// Raw path bytes as stored (backslash-separated)
    pub path: Vec<u8>,
}

/// A key resolved through the trie
#[derive(Debug, Clone, Copy)]
pub struct ResolvedEntry {
    pub node_index: u32,
    pub meta_index: u32,
}

/// Read-only handle over an idx/dat pair
pub struct Archive {
    layout: IndexLayout,
    trie: DirectoryTrie,
    strings: StringReader,
    meta: MetaTable,
    fat: Fat,
    dat_path: Option<PathBuf>,
    dat: Option<DatReader>,
}

impl Archive {
    /// Open an archive. The data file may be omitted for commands that
    /// only touch the index.
    pub fn open(idx_path: &Path, dat_path: Option<&Path>) -> Result<Self> {
        debug!("opening archive: {:?}", idx_path);

        let file = File::open(idx_path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header = [0u8; crate::layout::IDX_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let layout = IndexLayout::parse(&header, file_len)?;

        let trie = DirectoryTrie::parse(&layout.read_channel(&mut reader, CHANNEL_TRIE)?)?;
        let strings = StringReader::new(layout.read_channel(&mut reader, CHANNEL_STRINGS)?);
        let meta = MetaTable::parse(&layout.read_channel(&mut reader, CHANNEL_META)?)?;
        let fat = Fat::parse(&layout.read_channel(&mut reader, CHANNEL_FAT)?);

        debug!(
            "archive opened: {} nodes, {} meta records, {} fat entries",
            trie.len(),
            meta.len(),
            fat.len()
        );

        Ok(Self {
            layout,
            trie,
            strings,
            meta,
            fat,
            dat_path: dat_path.map(Path::to_path_buf),
            dat: None,
        })
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub fn trie(&self) -> &DirectoryTrie {
        &self.trie
    }

    pub fn fat(&self) -> &Fat {
        &self.fat
    }

    pub fn meta_count(&self) -> u32 {
        self.meta.len()
    }

    pub fn meta_record(&self, index: u32) -> Option<&MetaRecord> {
        self.meta.record(index)
    }

    pub fn strings_mut(&mut self) -> &mut StringReader {
        &mut self.strings
    }

    pub fn dat_path(&self) -> Option<&Path> {
        self.dat_path.as_deref()
    }

    /// List every node `>= 1` with its stored path, reachable or not.
    /// Callers filter on `meta_index < meta_count` and payload presence.
    pub fn entries(&mut self) -> Result<Vec<ArchiveEntry>> {
        let mut out = Vec::with_capacity(self.trie.len().saturating_sub(1));
        for node_index in 1..self.trie.len() as u32 {
            let node = *self
                .trie
                .node(node_index)
                .ok_or_else(|| Error::InconsistentArchive(format!("missing node {node_index}")))?;
            let path = self.strings.lookup(node.name_index())?;
            out.push(ArchiveEntry {
                node_index,
                meta_index: node.meta_index,
                path,
            });
        }
        Ok(out)
    }

    /// Node for a listed entry index.
    pub fn node(&self, node_index: u32) -> Option<&DtNode> {
        self.trie.node(node_index)
    }

    /// Resolve a key: exact first, then the lowercased form. Keys are
    /// expected backslash-separated already.
    pub fn find_meta(&mut self, key: &[u8]) -> Result<Option<ResolvedEntry>> {
        if let Some((node_index, node)) = self.trie.lookup(key, &mut self.strings)? {
            return Ok(Some(ResolvedEntry {
                node_index,
                meta_index: node.meta_index,
            }));
        }

        let lowered = String::from_utf8_lossy(key).to_lowercase().into_bytes();
        if lowered != key {
            if let Some((node_index, node)) = self.trie.lookup(&lowered, &mut self.strings)? {
                trace!(
                    "key {:?} resolved via lowercase fallback",
                    String::from_utf8_lossy(key)
                );
                return Ok(Some(ResolvedEntry {
                    node_index,
                    meta_index: node.meta_index,
                }));
            }
        }

        Ok(None)
    }

    /// Read and unwrap the payload addressed by a meta record.
    pub fn read_file_bytes(&mut self, meta_index: u32) -> Result<Vec<u8>> {
        let record = *self
            .meta
            .record(meta_index)
            .ok_or_else(|| Error::EntryNotFound(format!("meta record {meta_index}")))?;
        if !record.has_payload() {
            return Err(Error::EntryNotFound(format!(
                "meta record {meta_index} has no payload"
            )));
        }

        if self.dat.is_none() {
            let path = self.dat_path.clone().ok_or_else(|| {
                Error::InconsistentArchive("archive opened without a data file".into())
            })?;
            self.dat = Some(DatReader::open(&path)?);
        }
        let dat = match self.dat.as_mut() {
            Some(dat) => dat,
            None => unreachable!("data reader opened above"),
        };

        let wrapped = read_payload(dat, &self.fat, record.start_block, record.size)?;
        wrapper::unwrap(&wrapped)
    }
}
