//! ABCD archive storage
//!
//! Implementation of the two-file "ABCD" game archive: a striped
//! multi-channel index file (directory trie, string table, meta table,
//! FAT) paired with a block-chained data file of wrapped, zlib-compressed
//! payloads. The format is undocumented; this layout was reverse
//! engineered. The crate covers reading, deterministic repacking from a
//! file list, and transactional in-place patching.

pub mod archive;
pub mod datfat;
pub mod error;
pub mod layout;
pub mod meta;
pub mod patch;
pub mod repack;
pub mod strings;
pub mod trie;
pub mod workers;
pub mod wrapper;

pub use archive::{Archive, ArchiveEntry, ResolvedEntry};
pub use datfat::{Fat, BLOCK_SIZE, FAT_END_OF_CHAIN};
pub use error::{Error, Result};
pub use layout::{ChannelDesc, IndexLayout, CHANNEL_COUNT, IDX_MAGIC};
pub use meta::{MetaRecord, MetaTable, META_RECORD_SIZE};
pub use patch::{patch, PatchOptions, PatchRequest, PatchSummary};
pub use repack::{normalize_key, repack, RepackInput, RepackOptions, RepackSummary};
pub use strings::{StringReader, StringTableBuilder, STRING_RECORD_SIZE};
pub use trie::{DirectoryTrie, DtNode, TrieBuilder, DT_NODE_SIZE};
