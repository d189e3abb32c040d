use std::fmt;

use chunkdb_types::{ChunkPointer, NumberSize};

use crate::chain::ChainIo;
use crate::error::StoreResult;

/// Callback that fills a freshly allocated chunk.
pub type PopulateFn = Box<dyn FnOnce(&mut ChainIo<'_>) -> StoreResult<()> + Send>;

/// Request for one new chunk.
///
/// A ticket is consumed by [`ChunkStore::allocate`](crate::ChunkStore::allocate)
/// and produces exactly one chunk, or an error.
pub struct AllocateTicket {
    pub(crate) bytes: u64,
    pub(crate) next: ChunkPointer,
    pub(crate) next_size: Option<NumberSize>,
    pub(crate) user_data: bool,
    pub(crate) populate: Option<PopulateFn>,
}

impl AllocateTicket {
    /// Request a chunk with room for `bytes` data bytes.
    ///
    /// Very small requests are rounded up so the chunk's header can later
    /// widen its next pointer in place.
    pub fn bytes(bytes: u64) -> Self {
        Self {
            bytes,
            next: ChunkPointer::NULL,
            next_size: None,
            user_data: true,
            populate: None,
        }
    }

    /// Link the new chunk to `next` right away.
    pub fn with_next(mut self, next: ChunkPointer) -> Self {
        self.next = next;
        self
    }

    /// Reserve exactly `size` for the next pointer instead of letting the
    /// store choose.
    pub fn with_next_size(mut self, size: NumberSize) -> Self {
        self.next_size = Some(size);
        self
    }

    /// Mark the chunk as store-internal bookkeeping.
    pub fn internal(mut self) -> Self {
        self.user_data = false;
        self
    }

    /// Run `populate` over the new chunk before `allocate` returns.
    pub fn with_populate<F>(mut self, populate: F) -> Self
    where
        F: FnOnce(&mut ChainIo<'_>) -> StoreResult<()> + Send + 'static,
    {
        self.populate = Some(Box::new(populate));
        self
    }

    /// Allocate room for `data.len()` bytes and write `data` into them.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self::bytes(data.len() as u64).with_populate(move |io| io.write_bytes(&data))
    }

    pub fn requested_bytes(&self) -> u64 {
        self.bytes
    }
}

impl fmt::Debug for AllocateTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocateTicket")
            .field("bytes", &self.bytes)
            .field("next", &self.next)
            .field("next_size", &self.next_size)
            .field("user_data", &self.user_data)
            .field("populate", &self.populate.is_some())
            .finish()
    }
}
