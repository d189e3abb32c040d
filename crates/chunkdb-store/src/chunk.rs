use chunkdb_types::{ChunkPointer, NumberSize};

use crate::error::{StoreError, StoreResult};

/// Magic bytes at offset 0 of every store.
pub const STORE_MAGIC: &[u8; 4] = b"CKDB";
/// Current store layout version.
pub const STORE_VERSION: u32 = 1;
/// Length of the store header; the first chunk starts here.
pub const STORE_HEADER_LEN: u64 = 8;

const FLAG_USED: u8 = 0b0000_0001;
const FLAG_USER_DATA: u8 = 0b0000_0010;
const KNOWN_FLAGS: u8 = FLAG_USED | FLAG_USER_DATA;

/// Longest possible header: two width bytes, 8-byte capacity and size,
/// 8-byte next pointer.
pub const MAX_HEADER_LEN: u64 = 2 + 2 * 8 + 8;

/// Flag byte of a chunk header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkFlags {
    /// Allocated, as opposed to sitting in the free list.
    pub used: bool,
    /// Holds caller data rather than store-internal bookkeeping.
    pub user_data: bool,
}

impl ChunkFlags {
    pub const FREE: Self = Self {
        used: false,
        user_data: false,
    };

    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.used {
            b |= FLAG_USED;
        }
        if self.user_data {
            b |= FLAG_USER_DATA;
        }
        b
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        if b & !KNOWN_FLAGS != 0 {
            return None;
        }
        Some(Self {
            used: b & FLAG_USED != 0,
            user_data: b & FLAG_USER_DATA != 0,
        })
    }
}

/// Snapshot of one chunk header.
///
/// On-medium layout (all integers little-endian):
/// ```text
/// [1 byte: widths: low nibble body NumberSize, high nibble next NumberSize]
/// [1 byte: flags: bit0 used, bit1 user data]
/// [body bytes: capacity]
/// [body bytes: size]
/// [next bytes: next chunk pointer, 0 = none]
/// [capacity bytes: data]
/// ```
///
/// A `Chunk` is a copy taken at one moment. It goes stale as soon as the
/// store is mutated; re-read it through [`ChunkStore::chunk`](crate::ChunkStore::chunk).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub ptr: ChunkPointer,
    pub body_size: NumberSize,
    pub next_size: NumberSize,
    pub flags: ChunkFlags,
    pub capacity: u64,
    pub size: u64,
    pub next: ChunkPointer,
}

impl Chunk {
    pub const fn header_len_for(body_size: NumberSize, next_size: NumberSize) -> u64 {
        2 + 2 * body_size.bytes() as u64 + next_size.bytes() as u64
    }

    /// Header of a free chunk covering `span` bytes (header included).
    ///
    /// Free chunks carry no next pointer; the body width is the narrowest
    /// that holds the remaining capacity. Returns `None` if `span` cannot
    /// hold even an empty header.
    pub fn free_for_span(ptr: ChunkPointer, span: u64) -> Option<Self> {
        NumberSize::ALL[1..].iter().find_map(|&body| {
            let header = Self::header_len_for(body, NumberSize::Void);
            let capacity = span.checked_sub(header)?;
            body.can_fit_unsigned(capacity).then_some(Self {
                ptr,
                body_size: body,
                next_size: NumberSize::Void,
                flags: ChunkFlags::FREE,
                capacity,
                size: 0,
                next: ChunkPointer::NULL,
            })
        })
    }

    pub fn header_len(&self) -> u64 {
        Self::header_len_for(self.body_size, self.next_size)
    }

    /// Offset of the first data byte.
    pub fn data_start(&self) -> u64 {
        self.ptr.value() + self.header_len()
    }

    /// Offset one past the last data byte; also where the next physical
    /// chunk begins.
    pub fn data_end(&self) -> u64 {
        self.data_start() + self.capacity
    }

    /// Bytes this chunk occupies on the medium, header included.
    pub fn span(&self) -> u64 {
        self.header_len() + self.capacity
    }

    pub fn is_used(&self) -> bool {
        self.flags.used
    }

    pub fn has_next(&self) -> bool {
        !self.next.is_null()
    }

    /// Bytes still free after the logical end of this chunk.
    pub fn remaining(&self) -> u64 {
        self.capacity - self.size
    }

    pub fn can_link(&self, target: ChunkPointer) -> bool {
        self.next_size.can_fit_unsigned(target.value())
    }

    pub fn encode_header(&self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.header_len() as usize);
        out.push(self.body_size.ordinal() | (self.next_size.ordinal() << 4));
        out.push(self.flags.to_byte());
        self.body_size.write_to(&mut out, self.capacity)?;
        self.body_size.write_to(&mut out, self.size)?;
        if !self.can_link(self.next) {
            return Err(StoreError::PointerOverflow {
                ptr: self.ptr,
                target: self.next,
                width: self.next_size,
            });
        }
        self.next_size.write_to(&mut out, self.next.value())?;
        Ok(out)
    }

    /// Parse the two width bytes; returns `(body, next, flags)`.
    pub fn decode_prefix(ptr: ChunkPointer, prefix: [u8; 2]) -> StoreResult<(NumberSize, NumberSize, ChunkFlags)> {
        let corrupt = |reason: String| StoreError::Corrupt { ptr, reason };
        let body = NumberSize::from_ordinal(prefix[0] & 0x0F)
            .map_err(|_| corrupt(format!("bad body width nibble {:#x}", prefix[0] & 0x0F)))?;
        let next = NumberSize::from_ordinal(prefix[0] >> 4)
            .map_err(|_| corrupt(format!("bad next width nibble {:#x}", prefix[0] >> 4)))?;
        if body == NumberSize::Void {
            return Err(corrupt("void body width".into()));
        }
        let flags = ChunkFlags::from_byte(prefix[1])
            .ok_or_else(|| corrupt(format!("unknown flag bits {:#010b}", prefix[1])))?;
        Ok((body, next, flags))
    }

    /// Decode a full header. `bytes` must start at `ptr` and hold at least
    /// [`header_len_for`](Self::header_len_for) bytes for the widths in its
    /// first byte.
    pub fn decode_header(ptr: ChunkPointer, bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < 2 {
            return Err(StoreError::Corrupt {
                ptr,
                reason: "truncated header".into(),
            });
        }
        let (body_size, next_size, flags) = Self::decode_prefix(ptr, [bytes[0], bytes[1]])?;
        let len = Self::header_len_for(body_size, next_size) as usize;
        if bytes.len() < len {
            return Err(StoreError::Corrupt {
                ptr,
                reason: format!("header needs {len} bytes, have {}", bytes.len()),
            });
        }
        let b = body_size.bytes();
        let capacity = body_size.read_unsigned(&bytes[2..])?;
        let size = body_size.read_unsigned(&bytes[2 + b..])?;
        let next = ChunkPointer::new(next_size.read_unsigned(&bytes[2 + 2 * b..])?);
        if size > capacity {
            return Err(StoreError::Corrupt {
                ptr,
                reason: format!("size {size} exceeds capacity {capacity}"),
            });
        }
        Ok(Self {
            ptr,
            body_size,
            next_size,
            flags,
            capacity,
            size,
            next,
        })
    }
}
