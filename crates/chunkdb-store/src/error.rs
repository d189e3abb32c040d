use chunkdb_types::{ChunkPointer, NumberSize, TypeError};

/// Errors from chunk store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the backing medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A number could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] TypeError),

    /// A chunk header is malformed or points outside the medium.
    #[error("corrupt chunk {ptr}: {reason}")]
    Corrupt { ptr: ChunkPointer, reason: String },

    /// Following next pointers revisited a chunk.
    #[error("chunk chain starting at {head} loops back to {repeated}")]
    ChainCycle {
        head: ChunkPointer,
        repeated: ChunkPointer,
    },

    /// The medium does not start with a chunkdb store header.
    #[error("invalid store magic: expected CKDB, got {actual}")]
    InvalidMagic { actual: String },

    #[error("unsupported store version: {0}")]
    UnsupportedVersion(u32),

    /// A store cannot be created over a medium that already holds data.
    #[error("medium is not empty ({size} bytes)")]
    MediumNotEmpty { size: u64 },

    /// A next pointer does not fit the width reserved in a chunk header.
    #[error("pointer {target} does not fit the {width:?} next slot of chunk {ptr}")]
    PointerOverflow {
        ptr: ChunkPointer,
        target: ChunkPointer,
        width: NumberSize,
    },

    /// The chunk is not allocated (already free).
    #[error("chunk {0} is not allocated")]
    NotAllocated(ChunkPointer),

    /// A read went past the logical end of a chain.
    #[error("read past end of chain {head}: position {position}, size {size}")]
    OutOfBounds {
        head: ChunkPointer,
        position: u64,
        size: u64,
    },

    /// The null pointer was dereferenced.
    #[error("null chunk pointer dereferenced")]
    NullPointer,
}

impl StoreError {
    /// `true` for errors that describe damaged on-medium structure.
    ///
    /// Scanning and repair tools match on this to step past a bad region
    /// instead of aborting.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::ChainCycle { .. } | Self::InvalidMagic { .. }
        )
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for std::io::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(e) => e,
            e @ StoreError::OutOfBounds { .. } => Self::new(std::io::ErrorKind::UnexpectedEof, e),
            e => Self::other(e),
        }
    }
}
