use std::fmt;

use serde::{Deserialize, Serialize};

/// Byte offset of a chunk header inside the medium.
///
/// A pointer is a relation, not an owner: the chunk behind it may have been
/// moved or freed since the pointer was taken, so it must be re-resolved
/// through the store on every dereference. Offset `0` is the store header and
/// never starts a chunk, which makes it the null sentinel.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPointer(u64);

impl ChunkPointer {
    pub const NULL: Self = Self(0);

    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw offset, including `0` for null.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The offset, or `None` for the null pointer.
    pub fn get(self) -> Option<u64> {
        if self.is_null() {
            None
        } else {
            Some(self.0)
        }
    }

    /// A reference to `offset` bytes into the chain starting here.
    pub const fn at(self, offset: u64) -> Reference {
        Reference { ptr: self, offset }
    }
}

impl fmt::Debug for ChunkPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "*null")
        } else {
            write!(f, "*{}", self.0)
        }
    }
}

impl fmt::Display for ChunkPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A read/write position: a chunk chain plus a byte offset into it.
///
/// Used for values stored out-of-line from their containing struct.
/// Encoded on the medium as [`Reference::ENCODED_LEN`] bytes: the pointer
/// then the offset, both `u64` little-endian.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub ptr: ChunkPointer,
    pub offset: u64,
}

impl Reference {
    pub const NULL: Self = Self {
        ptr: ChunkPointer::NULL,
        offset: 0,
    };

    pub const ENCODED_LEN: usize = 16;

    pub const fn new(ptr: ChunkPointer, offset: u64) -> Self {
        Self { ptr, offset }
    }

    pub const fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.ptr.value().to_le_bytes());
        out[8..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut ptr = [0u8; 8];
        let mut offset = [0u8; 8];
        ptr.copy_from_slice(&bytes[..8]);
        offset.copy_from_slice(&bytes[8..]);
        Self {
            ptr: ChunkPointer::new(u64::from_le_bytes(ptr)),
            offset: u64::from_le_bytes(offset),
        }
    }

    /// Point this reference at `to` if it currently points at `from`.
    ///
    /// Returns `true` when the reference was rewritten. Holders of long-lived
    /// references call this from a chunk-move notification.
    pub fn rebase(&mut self, from: ChunkPointer, to: ChunkPointer) -> bool {
        if self.ptr == from {
            self.ptr = to;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({:?}+{})", self.ptr, self.offset)
    }
}
