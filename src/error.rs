use thiserror::Error;

use crate::schedule::buffer::MemoryLocation;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of scheduling and linking failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inconsistent graph or alias structure handed in by upstream passes
    GraphConsistency,
    /// A memory location ran out of space
    Capacity,
    /// Symbol resolution or relocation failed
    Link,
    /// Anything else (I/O, serialization, unsupported input)
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Dangling connection: input {input} of node `{node}` has no recorded buffer")]
    DanglingConnection { node: String, input: usize },

    #[error("Buffer for output `{0}` was allocated more than once")]
    DuplicateAllocation(String),

    #[error("Release of unallocated buffer {0}")]
    ReleaseWithoutAllocation(String),

    #[error("Alias cycle detected at buffer {0}")]
    AliasCycle(String),

    #[error("Invalid alias: {0}")]
    InvalidAlias(String),

    #[error("Out of memory in {location}: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        location: MemoryLocation,
        requested: usize,
        available: usize,
    },

    #[error("Allocator error: {0}")]
    AllocatorError(String),

    #[error("Duplicate definition of symbol `{symbol}` in section {section}")]
    DuplicateSymbol { symbol: String, section: String },

    #[error("Unresolved symbol `{symbol}` referenced from section {section}")]
    UnresolvedSymbol { symbol: String, section: String },

    #[error("Relocation of `{symbol}` in section {section} overflows: value {value} does not fit in {bits} bits")]
    RelocationOverflow {
        symbol: String,
        section: String,
        value: u64,
        bits: u32,
    },

    #[error("Invalid section: {0}")]
    InvalidSection(String),

    #[error("Invalid binary: {0}")]
    InvalidBinary(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidGraph(_)
            | Error::DanglingConnection { .. }
            | Error::DuplicateAllocation(_)
            | Error::ReleaseWithoutAllocation(_)
            | Error::AliasCycle(_)
            | Error::InvalidAlias(_) => ErrorKind::GraphConsistency,
            Error::OutOfMemory { .. } | Error::AllocatorError(_) => ErrorKind::Capacity,
            Error::DuplicateSymbol { .. }
            | Error::UnresolvedSymbol { .. }
            | Error::RelocationOverflow { .. }
            | Error::InvalidSection(_) => ErrorKind::Link,
            Error::IoError(_)
            | Error::SerializationError(_)
            | Error::InvalidBinary(_)
            | Error::UnsupportedFeature(_) => ErrorKind::Other,
        }
    }
}
