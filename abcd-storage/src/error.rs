//! Error types for ABCD archive operations

use std::io;
use thiserror::Error;

/// Result type for ABCD archive operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unrecognized index layout: {0}")]
    UnrecognizedLayout(String),

    #[error("Corrupt payload wrapper: {0}")]
    CorruptWrapper(String),

    #[error("Short read in block {block}: expected {expected} bytes, got {actual}")]
    ShortRead {
        block: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Unexpected end of FAT chain at block {0}")]
    UnexpectedEndOfChain(u32),

    #[error("Invalid start block: {0}")]
    InvalidStartBlock(u32),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Cycle in string chain starting at record {0}")]
    CycleInStringChain(u32),

    #[error("String record index out of range: {0}")]
    InvalidStringIndex(u32),

    #[error("Inconsistent archive: {0}")]
    InconsistentArchive(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Patch rolled back after failure: {0}")]
    RolledBack(Box<Error>),
}

impl Error {
    /// True when a failed patch was unwound back to the pre-patch state.
    pub fn rolled_back(&self) -> bool {
        matches!(self, Error::RolledBack(_))
    }
}
