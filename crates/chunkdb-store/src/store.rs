use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use chunkdb_types::{ChunkPointer, NumberSize};
use tracing::{debug, warn};

use crate::chain::{read_range, ChainIo};
use crate::chunk::{Chunk, ChunkFlags, MAX_HEADER_LEN, STORE_HEADER_LEN, STORE_MAGIC, STORE_VERSION};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::medium::{Medium, MemoryMedium};
use crate::ticket::AllocateTicket;

/// Smallest span a free chunk can occupy: an empty header with one-byte
/// capacity and size fields and no next pointer.
const MIN_FREE_SPAN: u64 = Chunk::header_len_for(NumberSize::Byte, NumberSize::Void);

/// Least capacity of a chunk whose next pointer is `next_size` wide: enough
/// for its header to later widen to [`NumberSize::Long`] in place.
const fn widen_reserve(next_size: NumberSize) -> u64 {
    (NumberSize::Long.bytes() - next_size.bytes()) as u64
}

/// Receives a notification for every chain the store relocates.
///
/// Chunk pointers are relations, so anyone holding a pointer or a
/// [`Reference`](chunkdb_types::Reference) into a moved chain must rewrite
/// it from `from` to `to`.
pub trait MoveListener {
    fn chunk_moved(&mut self, from: ChunkPointer, to: ChunkPointer);
}

impl<F: FnMut(ChunkPointer, ChunkPointer)> MoveListener for F {
    fn chunk_moved(&mut self, from: ChunkPointer, to: ChunkPointer) {
        self(from, to)
    }
}

/// Outcome of [`ChunkStore::defragment`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefragReport {
    /// Chains consolidated into a single chunk.
    pub moved: usize,
    pub medium_size_before: u64,
    pub medium_size_after: u64,
}

/// Chunk allocator over a [`Medium`].
///
/// The medium starts with an 8-byte store header followed by chunks laid
/// end to end with no gaps. Every chunk is either used or free; free chunks
/// are tracked in an in-memory map rebuilt by scanning on open.
pub struct ChunkStore {
    medium: Box<dyn Medium>,
    config: StoreConfig,
    /// Free chunks: header offset → span (header plus capacity).
    free: BTreeMap<u64, u64>,
    /// Cached medium size.
    end: u64,
}

impl ChunkStore {
    /// Initialise a new store on an empty medium.
    ///
    /// Writes the store header and an internal root chunk of
    /// `config.root_capacity` bytes at [`STORE_HEADER_LEN`].
    pub fn create<M: Medium + 'static>(medium: M, config: StoreConfig) -> StoreResult<Self> {
        let size = medium.size()?;
        if size != 0 {
            return Err(StoreError::MediumNotEmpty { size });
        }

        let mut header = Vec::with_capacity(STORE_HEADER_LEN as usize);
        header.extend_from_slice(STORE_MAGIC);
        header.extend_from_slice(&STORE_VERSION.to_le_bytes());

        let mut store = Self {
            medium: Box::new(medium),
            config,
            free: BTreeMap::new(),
            end: 0,
        };
        store.medium.write_at(0, &header)?;
        store.end = STORE_HEADER_LEN;

        let root = store.allocate(AllocateTicket::bytes(store.config.root_capacity).internal())?;
        debug!(root = root.ptr.value(), capacity = root.capacity, "created chunk store");
        Ok(store)
    }

    /// Open an existing store, validating its header and rebuilding the free
    /// list from the chunk headers.
    pub fn open<M: Medium + 'static>(medium: M, config: StoreConfig) -> StoreResult<Self> {
        let end = medium.size()?;
        let mut header = [0u8; STORE_HEADER_LEN as usize];
        let available = end.min(STORE_HEADER_LEN) as usize;
        medium.read_at(0, &mut header[..available])?;
        if available < STORE_HEADER_LEN as usize || &header[..4] != STORE_MAGIC {
            return Err(StoreError::InvalidMagic {
                actual: header[..available.min(4)].escape_ascii().to_string(),
            });
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != STORE_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }

        let mut store = Self {
            medium: Box::new(medium),
            config,
            free: BTreeMap::new(),
            end,
        };
        if end == STORE_HEADER_LEN {
            return Err(StoreError::Corrupt {
                ptr: ChunkPointer::new(STORE_HEADER_LEN),
                reason: "store has no root chunk".into(),
            });
        }

        let mut free = BTreeMap::new();
        let mut count = 0usize;
        for chunk in store.chunks() {
            let chunk = chunk?;
            count += 1;
            if !chunk.is_used() {
                free.insert(chunk.ptr.value(), chunk.span());
            }
        }
        store.free = free;
        debug!(chunks = count, free = store.free.len(), size = end, "opened chunk store");
        Ok(store)
    }

    /// Open the store on `medium`, creating it if the medium is empty.
    pub fn open_or_create<M: Medium + 'static>(medium: M, config: StoreConfig) -> StoreResult<Self> {
        if medium.size()? == 0 {
            Self::create(medium, config)
        } else {
            Self::open(medium, config)
        }
    }

    /// Fresh store backed by a [`MemoryMedium`].
    pub fn in_memory() -> StoreResult<Self> {
        Self::create(MemoryMedium::new(), StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current size of the medium in bytes.
    pub fn medium_size(&self) -> u64 {
        self.end
    }

    pub fn flush(&mut self) -> StoreResult<()> {
        self.medium.flush()?;
        Ok(())
    }

    pub fn into_medium(self) -> Box<dyn Medium> {
        self.medium
    }

    /// The root chunk at [`STORE_HEADER_LEN`].
    pub fn first_chunk(&self) -> StoreResult<Chunk> {
        self.chunk(ChunkPointer::new(STORE_HEADER_LEN))
    }

    /// Re-read the header at `ptr`.
    ///
    /// Fails with [`StoreError::Corrupt`] if the header is malformed, lies
    /// outside the medium, or points outside it.
    pub fn chunk(&self, ptr: ChunkPointer) -> StoreResult<Chunk> {
        if ptr.is_null() {
            return Err(StoreError::NullPointer);
        }
        let at = ptr.value();
        let corrupt = |reason: String| StoreError::Corrupt { ptr, reason };
        if at < STORE_HEADER_LEN || at.saturating_add(2) > self.end {
            return Err(corrupt(format!("offset outside medium of {} bytes", self.end)));
        }

        let available = (self.end - at).min(MAX_HEADER_LEN) as usize;
        let mut buf = [0u8; MAX_HEADER_LEN as usize];
        self.medium.read_at(at, &mut buf[..available])?;
        let chunk = Chunk::decode_header(ptr, &buf[..available])?;

        let data_end = at
            .checked_add(chunk.header_len())
            .and_then(|start| start.checked_add(chunk.capacity));
        match data_end {
            Some(data_end) if data_end <= self.end => {}
            _ => {
                return Err(corrupt(format!(
                    "capacity {} runs past medium end {}",
                    chunk.capacity, self.end
                )))
            }
        }
        if chunk.has_next() {
            if !chunk.is_used() {
                return Err(corrupt("free chunk carries a next pointer".into()));
            }
            if chunk.next == ptr {
                return Err(StoreError::ChainCycle {
                    head: ptr,
                    repeated: ptr,
                });
            }
            let next = chunk.next.value();
            if next < STORE_HEADER_LEN || next >= self.end {
                return Err(corrupt(format!("next pointer {next} outside medium")));
            }
        }
        Ok(chunk)
    }

    pub(crate) fn write_header(&mut self, chunk: &Chunk) -> StoreResult<()> {
        let bytes = chunk.encode_header()?;
        self.medium.write_at(chunk.ptr.value(), &bytes)?;
        Ok(())
    }

    pub(crate) fn read_raw(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.medium.read_at(offset, buf)?;
        Ok(())
    }

    pub(crate) fn write_raw(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.medium.write_at(offset, data)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate one chunk for `ticket`.
    ///
    /// Takes the smallest free chunk that can hold the request, splitting off
    /// any surplus large enough to be useful, and otherwise appends a new
    /// chunk at the end of the medium. A populate callback on the ticket runs
    /// before this returns; the returned header reflects what it wrote.
    pub fn allocate(&mut self, ticket: AllocateTicket) -> StoreResult<Chunk> {
        let AllocateTicket {
            bytes,
            next,
            next_size,
            user_data,
            populate,
        } = ticket;

        let next_size = next_size.unwrap_or_else(|| self.next_size_for(next));
        if !next_size.can_fit_unsigned(next.value()) {
            return Err(StoreError::PointerOverflow {
                ptr: ChunkPointer::NULL,
                target: next,
                width: next_size,
            });
        }
        let bytes = bytes.max(widen_reserve(next_size));
        let body_size = NumberSize::by_size(bytes).max(NumberSize::Byte);
        let needed = Chunk::header_len_for(body_size, next_size) + bytes;

        let (mut chunk, reused) = match self.take_best_fit(bytes, needed, body_size, next_size)? {
            Some(chunk) => (chunk, true),
            None => {
                let ptr = ChunkPointer::new(self.end);
                let end = self.end + needed;
                self.medium.set_size(end)?;
                self.end = end;
                let chunk = Chunk {
                    ptr,
                    body_size,
                    next_size,
                    flags: ChunkFlags::FREE,
                    capacity: bytes,
                    size: 0,
                    next: ChunkPointer::NULL,
                };
                (chunk, false)
            }
        };
        chunk.flags = ChunkFlags {
            used: true,
            user_data,
        };
        chunk.next = next;
        self.write_header(&chunk)?;
        debug!(
            ptr = chunk.ptr.value(),
            requested = bytes,
            capacity = chunk.capacity,
            reused,
            "allocated chunk"
        );

        match populate {
            Some(populate) => {
                let mut io = self.io(chunk.ptr);
                populate(&mut io)?;
                self.chunk(chunk.ptr)
            }
            None => Ok(chunk),
        }
    }

    fn next_size_for(&self, next: ChunkPointer) -> NumberSize {
        let reach = self.end.saturating_mul(2).max(next.value());
        self.config.next_pointer_size.max(NumberSize::by_size(reach))
    }

    fn take_best_fit(
        &mut self,
        bytes: u64,
        needed: u64,
        body_size: NumberSize,
        next_size: NumberSize,
    ) -> StoreResult<Option<Chunk>> {
        let mut candidates: Vec<(u64, u64)> = self
            .free
            .iter()
            .filter(|(_, &span)| span >= needed)
            .map(|(&ptr, &span)| (span, ptr))
            .collect();
        candidates.sort_unstable();

        for (span, ptr) in candidates {
            let surplus = span - needed;
            if surplus >= MIN_FREE_SPAN + self.config.min_split_capacity {
                if let Some(rest) = Chunk::free_for_span(ChunkPointer::new(ptr + needed), surplus) {
                    self.free.remove(&ptr);
                    self.write_header(&rest)?;
                    self.free.insert(rest.ptr.value(), surplus);
                    debug!(ptr, span, surplus, "split free chunk");
                    return Ok(Some(Chunk {
                        ptr: ChunkPointer::new(ptr),
                        body_size,
                        next_size,
                        flags: ChunkFlags::FREE,
                        capacity: bytes,
                        size: 0,
                        next: ChunkPointer::NULL,
                    }));
                }
            }
            if let Some((body_size, capacity)) = fit_whole_span(span, bytes, body_size, next_size) {
                self.free.remove(&ptr);
                return Ok(Some(Chunk {
                    ptr: ChunkPointer::new(ptr),
                    body_size,
                    next_size,
                    flags: ChunkFlags::FREE,
                    capacity,
                    size: 0,
                    next: ChunkPointer::NULL,
                }));
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Freeing
    // -----------------------------------------------------------------------

    /// Return `ptrs` to free space.
    ///
    /// If the freed chunks end at the medium tail, that trailing run is cut
    /// off the medium. Chunks already free before this call are left in
    /// place even when they end up at the new tail. The remaining chunks
    /// join the free list, merged with free neighbours when
    /// [`StoreConfig::coalesce_free`] is set.
    pub fn free(&mut self, ptrs: &[ChunkPointer]) -> StoreResult<()> {
        let mut ptrs = ptrs.to_vec();
        ptrs.sort_unstable();
        ptrs.dedup();

        let mut chunks = Vec::with_capacity(ptrs.len());
        for ptr in ptrs {
            let chunk = self.chunk(ptr)?;
            if !chunk.is_used() {
                return Err(StoreError::NotAllocated(ptr));
            }
            chunks.push(chunk);
        }
        let count = chunks.len();

        let mut tail = self.end;
        while let Some(last) = chunks.last() {
            if last.data_end() != tail || last.ptr.value() <= STORE_HEADER_LEN {
                break;
            }
            tail = last.ptr.value();
            chunks.pop();
        }
        if tail < self.end {
            self.medium.set_size(tail)?;
            debug!(from = self.end, to = tail, "truncated medium tail");
            self.end = tail;
        }

        for chunk in &chunks {
            self.release(chunk.ptr.value(), chunk.span())?;
        }
        debug!(count, "freed chunks");
        Ok(())
    }

    /// Free every chunk of the chain starting at `head`.
    pub fn free_chain(&mut self, head: ChunkPointer) -> StoreResult<()> {
        let ptrs: Vec<ChunkPointer> = self.chain(head)?.iter().map(|c| c.ptr).collect();
        self.free(&ptrs)
    }

    fn release(&mut self, ptr: u64, span: u64) -> StoreResult<()> {
        let (mut start, mut span) = (ptr, span);
        if self.config.coalesce_free {
            if let Some(next_span) = self.free.remove(&(start + span)) {
                span += next_span;
            }
            if let Some((&prev, &prev_span)) = self.free.range(..start).next_back() {
                if prev + prev_span == start {
                    self.free.remove(&prev);
                    start = prev;
                    span += prev_span;
                }
            }
        }
        let chunk = Chunk::free_for_span(ChunkPointer::new(start), span).ok_or_else(|| {
            StoreError::Corrupt {
                ptr: ChunkPointer::new(start),
                reason: format!("span {span} too small for a free header"),
            }
        })?;
        self.write_header(&chunk)?;
        self.free.insert(start, span);
        Ok(())
    }

    /// Cut a free chunk sitting at the medium tail off the medium.
    fn truncate_free_tail(&mut self) -> StoreResult<()> {
        let Some((&ptr, &span)) = self.free.iter().next_back() else {
            return Ok(());
        };
        if ptr + span == self.end && ptr > STORE_HEADER_LEN {
            self.free.remove(&ptr);
            self.medium.set_size(ptr)?;
            debug!(from = self.end, to = ptr, "truncated free tail");
            self.end = ptr;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Every chunk of the chain starting at `head`, in link order.
    ///
    /// Fails with [`StoreError::ChainCycle`] if a chunk repeats and with
    /// [`StoreError::Corrupt`] if a link leads to a free chunk.
    pub fn chain(&self, head: ChunkPointer) -> StoreResult<Vec<Chunk>> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut ptr = head;
        loop {
            if !seen.insert(ptr) {
                return Err(StoreError::ChainCycle {
                    head,
                    repeated: ptr,
                });
            }
            let chunk = self.chunk(ptr)?;
            if !chunk.is_used() {
                return Err(StoreError::Corrupt {
                    ptr,
                    reason: format!("chain {head} links to a free chunk"),
                });
            }
            let next = chunk.next;
            chain.push(chunk);
            if next.is_null() {
                return Ok(chain);
            }
            ptr = next;
        }
    }

    /// Logical content of the chain starting at `head`.
    pub fn read_chain(&self, head: ChunkPointer) -> StoreResult<Vec<u8>> {
        let chain = self.chain(head)?;
        let size = chain.iter().map(|c| c.size).sum::<u64>();
        let mut out = vec![0u8; size as usize];
        read_range(self, &chain, 0, &mut out)?;
        Ok(out)
    }

    /// Physical walk over every chunk, used and free.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            store: self,
            pos: STORE_HEADER_LEN,
            failed: false,
        }
    }

    /// Free chunks as `(pointer, span)` pairs, in medium order.
    pub fn free_chunks(&self) -> Vec<(ChunkPointer, u64)> {
        self.free
            .iter()
            .map(|(&ptr, &span)| (ChunkPointer::new(ptr), span))
            .collect()
    }

    pub fn free_chunk_count(&self) -> usize {
        self.free.len()
    }

    /// Heads of all used chains: used chunks no other used chunk links to.
    pub fn chain_heads(&self) -> StoreResult<Vec<ChunkPointer>> {
        let mut used = BTreeSet::new();
        let mut linked = HashSet::new();
        for chunk in self.chunks() {
            let chunk = chunk?;
            if chunk.is_used() {
                used.insert(chunk.ptr);
                if chunk.has_next() {
                    linked.insert(chunk.next);
                }
            }
        }
        Ok(used.into_iter().filter(|p| !linked.contains(p)).collect())
    }

    /// Check the accounting invariants against a full scan.
    ///
    /// The free list must equal the set of unused chunks, and every next
    /// pointer of a used chunk must land on a used chunk.
    pub fn verify(&self) -> StoreResult<()> {
        let mut scanned_free = BTreeMap::new();
        let mut used = HashSet::new();
        let mut links = Vec::new();
        for chunk in self.chunks() {
            let chunk = chunk?;
            if chunk.is_used() {
                used.insert(chunk.ptr);
                if chunk.has_next() {
                    links.push((chunk.ptr, chunk.next));
                }
            } else {
                scanned_free.insert(chunk.ptr.value(), chunk.span());
            }
        }
        if scanned_free != self.free {
            warn!(
                scanned = scanned_free.len(),
                tracked = self.free.len(),
                "free list out of sync with medium"
            );
            return Err(StoreError::Corrupt {
                ptr: ChunkPointer::NULL,
                reason: "free list does not match unused chunks".into(),
            });
        }
        for (ptr, next) in links {
            if !used.contains(&next) {
                return Err(StoreError::Corrupt {
                    ptr,
                    reason: format!("next pointer {next} does not start a used chunk"),
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chain I/O and growth
    // -----------------------------------------------------------------------

    /// Cursor over the chain starting at `head`.
    pub fn io(&mut self, head: ChunkPointer) -> ChainIo<'_> {
        ChainIo::new(self, head)
    }

    /// Add at least `additional` bytes of capacity after `last`, the final
    /// chunk of a chain.
    ///
    /// A free chunk physically following `last` is absorbed into it when the
    /// merged capacity fits its header; otherwise a new chunk is allocated
    /// and linked. If the new chunk lies beyond the reach of `last`'s next
    /// pointer, that header is widened in place first.
    pub(crate) fn grow_chain(&mut self, last: &Chunk, additional: u64) -> StoreResult<()> {
        let following = last.data_end();
        if let Some(&span) = self.free.get(&following) {
            let capacity = last.capacity + span;
            if last.body_size.can_fit_unsigned(capacity) {
                self.free.remove(&following);
                let mut grown = last.clone();
                grown.capacity = capacity;
                self.write_header(&grown)?;
                debug!(ptr = last.ptr.value(), absorbed = span, capacity, "absorbed free neighbour");
                return Ok(());
            }
        }

        let ticket = AllocateTicket::bytes(additional.max(last.capacity));
        let ticket = if last.flags.user_data {
            ticket
        } else {
            ticket.internal()
        };
        let added = self.allocate(ticket)?;
        let mut linked = if last.can_link(added.ptr) {
            last.clone()
        } else {
            match self.widen_next(last, &added) {
                Ok(widened) => widened,
                Err(e) => {
                    self.free(&[added.ptr])?;
                    return Err(e);
                }
            }
        };
        linked.next = added.ptr;
        self.write_header(&linked)?;
        debug!(
            last = last.ptr.value(),
            added = added.ptr.value(),
            capacity = added.capacity,
            "extended chain"
        );
        Ok(())
    }

    /// Give `last` a next pointer wide enough to reach `spill`, a freshly
    /// allocated empty chunk, without moving `last`.
    ///
    /// The header grows into the front of the data region and the data shifts
    /// back by the same amount. Bytes pushed past the shrunken capacity move
    /// to the start of `spill`, so the chain's logical content is unchanged
    /// once `spill` is linked. Returns the widened header, not yet written.
    fn widen_next(&mut self, last: &Chunk, spill: &Chunk) -> StoreResult<Chunk> {
        let next_size = NumberSize::by_size(spill.ptr.value()).max(last.next_size);
        let delta = (next_size.bytes() - last.next_size.bytes()) as u64;
        let capacity = last
            .capacity
            .checked_sub(delta)
            .ok_or(StoreError::PointerOverflow {
                ptr: last.ptr,
                target: spill.ptr,
                width: last.next_size,
            })?;

        let mut data = vec![0u8; last.size as usize];
        self.read_raw(last.data_start(), &mut data)?;
        let kept = last.size.min(capacity);
        let (front, overflow) = data.split_at(kept as usize);
        if !overflow.is_empty() {
            let mut spilled = spill.clone();
            self.write_raw(spilled.data_start(), overflow)?;
            spilled.size = overflow.len() as u64;
            self.write_header(&spilled)?;
        }

        let widened = Chunk {
            next_size,
            capacity,
            size: kept,
            ..last.clone()
        };
        self.write_raw(widened.data_start(), front)?;
        debug!(
            ptr = last.ptr.value(),
            from = last.next_size.bytes(),
            to = next_size.bytes(),
            spilled = overflow.len(),
            "widened next pointer"
        );
        Ok(widened)
    }

    // -----------------------------------------------------------------------
    // Defragmentation
    // -----------------------------------------------------------------------

    /// Consolidate the chain at `head` into a single chunk.
    ///
    /// Returns the new head, or `head` unchanged when the chain already is a
    /// single chunk. The move is reported to `listener` before returning.
    pub fn move_chain<L: MoveListener + ?Sized>(
        &mut self,
        head: ChunkPointer,
        listener: &mut L,
    ) -> StoreResult<ChunkPointer> {
        let chain = self.chain(head)?;
        if chain.len() < 2 {
            return Ok(head);
        }
        let data = self.read_chain(head)?;
        let ticket = AllocateTicket::bytes(data.len() as u64);
        let ticket = if chain[0].flags.user_data {
            ticket
        } else {
            ticket.internal()
        };
        let target = self.allocate(ticket)?;
        self.io(target.ptr).write_bytes(&data)?;

        let ptrs: Vec<ChunkPointer> = chain.iter().map(|c| c.ptr).collect();
        self.free(&ptrs)?;
        debug!(
            from = head.value(),
            to = target.ptr.value(),
            chunks = chain.len(),
            len = data.len(),
            "moved chain"
        );
        listener.chunk_moved(head, target.ptr);
        Ok(target.ptr)
    }

    /// Consolidate every multi-chunk chain except the root chain.
    pub fn defragment<L: MoveListener + ?Sized>(&mut self, listener: &mut L) -> StoreResult<DefragReport> {
        let before = self.end;
        let root = ChunkPointer::new(STORE_HEADER_LEN);
        let mut moved = 0;
        for head in self.chain_heads()? {
            if head == root {
                continue;
            }
            if self.move_chain(head, listener)? != head {
                moved += 1;
            }
        }
        self.truncate_free_tail()?;
        debug!(moved, before, after = self.end, "defragmented store");
        Ok(DefragReport {
            moved,
            medium_size_before: before,
            medium_size_after: self.end,
        })
    }
}

/// Narrowest body width for a chunk taking all of `span`, if it still leaves
/// room for `bytes`.
fn fit_whole_span(
    span: u64,
    bytes: u64,
    min_body: NumberSize,
    next_size: NumberSize,
) -> Option<(NumberSize, u64)> {
    NumberSize::ALL
        .iter()
        .copied()
        .filter(|&body| body >= min_body)
        .find_map(|body| {
            let capacity = span.checked_sub(Chunk::header_len_for(body, next_size))?;
            (capacity >= bytes && body.can_fit_unsigned(capacity)).then_some((body, capacity))
        })
}

impl fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStore")
            .field("size", &self.end)
            .field("free", &self.free.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Iterator returned by [`ChunkStore::chunks`]. Stops after the first error.
pub struct Chunks<'a> {
    store: &'a ChunkStore,
    pos: u64,
    failed: bool,
}

impl Iterator for Chunks<'_> {
    type Item = StoreResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.store.end {
            return None;
        }
        match self.store.chunk(ChunkPointer::new(self.pos)) {
            Ok(chunk) => {
                self.pos = chunk.data_end();
                Some(Ok(chunk))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
