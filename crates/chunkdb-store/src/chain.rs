use std::io::{self, Read, Seek, SeekFrom, Write};

use chunkdb_types::{ChunkPointer, Reference};

use crate::chunk::Chunk;
use crate::error::{StoreError, StoreResult};
use crate::store::ChunkStore;

const ZERO_BLOCK: [u8; 4096] = [0; 4096];

/// Medium extents covering logical bytes `[pos, pos + len)` of `chain`, as
/// `(medium offset, offset into the caller's buffer, length)`.
///
/// Logical offsets are laid over the chain by capacity, so every chunk before
/// the one holding the last byte is full.
fn extents(chain: &[Chunk], pos: u64, len: usize) -> StoreResult<Vec<(u64, usize, usize)>> {
    let end = pos + len as u64;
    let mut out = Vec::new();
    let mut base = 0u64;
    let mut cursor = pos;
    for chunk in chain {
        if cursor >= end {
            break;
        }
        let chunk_end = base + chunk.capacity;
        if cursor < chunk_end {
            let n = chunk_end.min(end) - cursor;
            out.push((
                chunk.data_start() + (cursor - base),
                (cursor - pos) as usize,
                n as usize,
            ));
            cursor += n;
        }
        base = chunk_end;
    }
    if cursor < end {
        return Err(StoreError::OutOfBounds {
            head: chain.first().map(|c| c.ptr).unwrap_or(ChunkPointer::NULL),
            position: end,
            size: base,
        });
    }
    Ok(out)
}

pub(crate) fn read_range(store: &ChunkStore, chain: &[Chunk], pos: u64, buf: &mut [u8]) -> StoreResult<()> {
    for (offset, start, len) in extents(chain, pos, buf.len())? {
        store.read_raw(offset, &mut buf[start..start + len])?;
    }
    Ok(())
}

fn write_range(store: &mut ChunkStore, chain: &[Chunk], pos: u64, data: &[u8]) -> StoreResult<()> {
    for (offset, start, len) in extents(chain, pos, data.len())? {
        store.write_raw(offset, &data[start..start + len])?;
    }
    Ok(())
}

fn logical_size(chain: &[Chunk]) -> u64 {
    chain.iter().map(|c| c.size).sum()
}

fn total_capacity(chain: &[Chunk]) -> u64 {
    chain.iter().map(|c| c.capacity).sum()
}

/// Random-access cursor over one chunk chain.
///
/// Positions are logical byte offsets from the start of the chain; crossing
/// a chunk boundary is invisible to the caller. Writes past the end grow the
/// chain through the store, and size fields are only rewritten once the data
/// bytes of a write have landed.
pub struct ChainIo<'s> {
    store: &'s mut ChunkStore,
    head: ChunkPointer,
    pos: u64,
    chain: Option<Vec<Chunk>>,
}

impl<'s> ChainIo<'s> {
    pub(crate) fn new(store: &'s mut ChunkStore, head: ChunkPointer) -> Self {
        Self {
            store,
            head,
            pos: 0,
            chain: None,
        }
    }

    pub fn head(&self) -> ChunkPointer {
        self.head
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Move the cursor. Positions past the end are allowed; a later write
    /// zero-fills the gap.
    pub fn set_position(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// The current position as a [`Reference`].
    pub fn reference(&self) -> Reference {
        self.head.at(self.pos)
    }

    /// The underlying store.
    ///
    /// Drops the cached chain layout, since the caller may reshape it.
    pub fn store(&mut self) -> &mut ChunkStore {
        self.chain = None;
        self.store
    }

    fn take_chain(&mut self) -> StoreResult<Vec<Chunk>> {
        match self.chain.take() {
            Some(chain) => Ok(chain),
            None => self.store.chain(self.head),
        }
    }

    fn with_chain<T>(&mut self, f: impl FnOnce(&[Chunk]) -> T) -> StoreResult<T> {
        let chain = self.take_chain()?;
        let out = f(&chain);
        self.chain = Some(chain);
        Ok(out)
    }

    /// Logical size: the sum of the chunk sizes.
    pub fn size(&mut self) -> StoreResult<u64> {
        self.with_chain(logical_size)
    }

    pub fn capacity(&mut self) -> StoreResult<u64> {
        self.with_chain(total_capacity)
    }

    /// Number of chunks in the chain.
    pub fn chain_length(&mut self) -> StoreResult<usize> {
        self.with_chain(<[Chunk]>::len)
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Read up to `buf.len()` bytes, stopping at the logical end.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        let chain = self.take_chain()?;
        let size = logical_size(&chain);
        let n = size.saturating_sub(self.pos).min(buf.len() as u64) as usize;
        let result = read_range(self.store, &chain, self.pos, &mut buf[..n]);
        self.chain = Some(chain);
        result?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Fill `buf` completely or fail with [`StoreError::OutOfBounds`].
    pub fn read_exact_bytes(&mut self, buf: &mut [u8]) -> StoreResult<()> {
        let size = self.size()?;
        let end = self.pos + buf.len() as u64;
        if end > size {
            return Err(StoreError::OutOfBounds {
                head: self.head,
                position: end,
                size,
            });
        }
        self.read_bytes(buf).map(|_| ())
    }

    /// The whole logical content. The cursor does not move.
    pub fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        let chain = self.take_chain()?;
        let mut out = vec![0u8; logical_size(&chain) as usize];
        let result = read_range(self.store, &chain, 0, &mut out);
        self.chain = Some(chain);
        result.map(|_| out)
    }

    /// Advance the cursor by `n` bytes without reading them.
    pub fn skip(&mut self, n: u64) -> StoreResult<()> {
        let size = self.size()?;
        let target = self.pos + n;
        if target > size {
            return Err(StoreError::OutOfBounds {
                head: self.head,
                position: target,
                size,
            });
        }
        self.pos = target;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Write `data` at the cursor, growing the chain as needed.
    pub fn write_bytes(&mut self, data: &[u8]) -> StoreResult<()> {
        let mut chain = self.take_chain()?;
        let size = logical_size(&chain);
        let start = self.pos;
        let end = start + data.len() as u64;

        self.ensure_capacity(&mut chain, end)?;
        if start > size {
            self.write_zeros(&chain, size, start - size)?;
        }
        write_range(self.store, &chain, start, data)?;
        self.update_sizes(&mut chain, size.max(end))?;

        self.chain = Some(chain);
        self.pos = end;
        Ok(())
    }

    /// Set the logical size. Growing zero-fills; shrinking keeps capacity.
    pub fn set_size(&mut self, new_size: u64) -> StoreResult<()> {
        let mut chain = self.take_chain()?;
        let size = logical_size(&chain);
        if new_size > size {
            self.ensure_capacity(&mut chain, new_size)?;
            self.write_zeros(&chain, size, new_size - size)?;
        }
        self.update_sizes(&mut chain, new_size)?;
        self.chain = Some(chain);
        Ok(())
    }

    /// Unlink and free trailing chunks that hold no data. The head chunk is
    /// always kept. Returns the number of chunks freed.
    pub fn trim_capacity(&mut self) -> StoreResult<usize> {
        let chain = self.take_chain()?;
        let keep = chain.iter().rposition(|c| c.size > 0).unwrap_or(0);
        if keep + 1 >= chain.len() {
            self.chain = Some(chain);
            return Ok(0);
        }

        let mut last = chain[keep].clone();
        last.next = ChunkPointer::NULL;
        self.store.write_header(&last)?;
        let dropped: Vec<ChunkPointer> = chain[keep + 1..].iter().map(|c| c.ptr).collect();
        self.store.free(&dropped)?;
        Ok(dropped.len())
    }

    fn ensure_capacity(&mut self, chain: &mut Vec<Chunk>, needed: u64) -> StoreResult<()> {
        loop {
            let capacity = total_capacity(chain);
            if capacity >= needed {
                return Ok(());
            }
            let last = chain.last().cloned().ok_or(StoreError::NullPointer)?;
            self.store.grow_chain(&last, needed - capacity)?;
            *chain = self.store.chain(self.head)?;
        }
    }

    fn write_zeros(&mut self, chain: &[Chunk], from: u64, len: u64) -> StoreResult<()> {
        let mut pos = from;
        let end = from + len;
        while pos < end {
            let n = (end - pos).min(ZERO_BLOCK.len() as u64);
            write_range(self.store, chain, pos, &ZERO_BLOCK[..n as usize])?;
            pos += n;
        }
        Ok(())
    }

    fn update_sizes(&mut self, chain: &mut [Chunk], new_size: u64) -> StoreResult<()> {
        let mut base = 0u64;
        for chunk in chain.iter_mut() {
            let size = new_size.saturating_sub(base).min(chunk.capacity);
            if size != chunk.size {
                chunk.size = size;
                self.store.write_header(chunk)?;
            }
            base += chunk.capacity;
        }
        Ok(())
    }
}

impl Read for ChainIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl Write for ChainIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.store.flush()?)
    }
}

impl Seek for ChainIo<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            SeekFrom::End(delta) => (self.size()?, delta),
            SeekFrom::Current(delta) => (self.pos, delta),
        };
        let target = base.checked_add_signed(delta).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative or overflowing position")
        })?;
        self.pos = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::AllocateTicket;
    use chunkdb_types::{BitReader, BitWriter};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn store() -> ChunkStore {
        ChunkStore::in_memory().unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    // -----------------------------------------------------------------------
    // Growth
    // -----------------------------------------------------------------------

    #[test]
    fn eighteen_bytes_into_sixteen_byte_chunk_chains_twice() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(16)).unwrap().ptr;
        let data = pattern(18);

        let mut io = s.io(head);
        io.write_bytes(&data).unwrap();
        assert_eq!(io.chain_length().unwrap(), 2);
        assert_eq!(io.size().unwrap(), 18);
        assert_eq!(io.read_all().unwrap(), data);

        let chain = s.chain(head).unwrap();
        assert_eq!(chain[0].size, 16);
        assert_eq!(chain[1].size, 2);
        s.verify().unwrap();
    }

    #[test]
    fn growth_absorbs_following_free_chunk() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(8)).unwrap();
        let neighbour = s.allocate(AllocateTicket::bytes(40)).unwrap();
        let _guard = s.allocate(AllocateTicket::bytes(1)).unwrap();
        s.free(&[neighbour.ptr]).unwrap();

        let mut io = s.io(head.ptr);
        io.write_bytes(&pattern(30)).unwrap();
        assert_eq!(io.chain_length().unwrap(), 1);
        assert_eq!(io.capacity().unwrap(), neighbour.data_end() - head.data_start());
        assert_eq!(s.free_chunk_count(), 0);
        s.verify().unwrap();
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(4)).unwrap().ptr;
        let mut io = s.io(head);
        io.write_bytes(b"ab").unwrap();
        io.set_position(10);
        io.write_bytes(b"yz").unwrap();
        assert_eq!(io.read_all().unwrap(), b"ab\0\0\0\0\0\0\0\0yz");
    }

    #[test]
    fn overwrite_in_middle_keeps_size() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::with_data(pattern(40))).unwrap().ptr;
        let mut io = s.io(head);
        io.set_position(10);
        io.write_bytes(b"XYZ").unwrap();
        assert_eq!(io.size().unwrap(), 40);
        let all = io.read_all().unwrap();
        assert_eq!(&all[10..13], b"XYZ");
        assert_eq!(&all[..10], &pattern(40)[..10]);
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    #[test]
    fn reads_span_chunk_boundaries() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(5)).unwrap().ptr;
        let data = pattern(23);
        let mut io = s.io(head);
        io.write_bytes(&data).unwrap();
        assert!(io.chain_length().unwrap() > 1);

        io.set_position(3);
        let mut buf = [0u8; 9];
        io.read_exact_bytes(&mut buf).unwrap();
        assert_eq!(&buf, &data[3..12]);
        assert_eq!(io.position(), 12);
    }

    #[test]
    fn short_read_at_end() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::with_data(b"abc".to_vec())).unwrap().ptr;
        let mut io = s.io(head);
        io.set_position(1);
        let mut buf = [0u8; 8];
        assert_eq!(io.read_bytes(&mut buf).unwrap(), 2);
        assert_eq!(io.read_bytes(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_exact_past_end_is_out_of_bounds() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::with_data(b"abc".to_vec())).unwrap().ptr;
        let mut io = s.io(head);
        let err = io.read_exact_bytes(&mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, StoreError::OutOfBounds { position: 4, size: 3, .. }));
        assert!(matches!(io.skip(4), Err(StoreError::OutOfBounds { .. })));
        io.skip(3).unwrap();
        assert_eq!(io.position(), 3);
    }

    // -----------------------------------------------------------------------
    // Resizing
    // -----------------------------------------------------------------------

    #[test]
    fn set_size_grows_with_zeros_and_shrinks() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::with_data(b"data".to_vec())).unwrap().ptr;
        let mut io = s.io(head);
        io.set_size(9).unwrap();
        assert_eq!(io.read_all().unwrap(), b"data\0\0\0\0\0");
        io.set_size(2).unwrap();
        assert_eq!(io.read_all().unwrap(), b"da");
        io.set_size(4).unwrap();
        assert_eq!(io.read_all().unwrap(), b"da\0\0");
    }

    #[test]
    fn set_size_is_idempotent() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(6)).unwrap().ptr;
        s.io(head).write_bytes(&pattern(20)).unwrap();

        s.io(head).set_size(11).unwrap();
        let once = (s.chain(head).unwrap(), s.read_chain(head).unwrap(), s.medium_size());
        s.io(head).set_size(11).unwrap();
        let twice = (s.chain(head).unwrap(), s.read_chain(head).unwrap(), s.medium_size());
        assert_eq!(once, twice);
    }

    #[test]
    fn trim_capacity_frees_empty_tail_chunks() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(4)).unwrap().ptr;
        let mut io = s.io(head);
        for piece in pattern(30).chunks(3) {
            io.write_bytes(piece).unwrap();
        }
        let before = io.chain_length().unwrap();
        assert!(before >= 3);

        io.set_size(3).unwrap();
        assert_eq!(io.trim_capacity().unwrap(), before - 1);
        assert_eq!(io.chain_length().unwrap(), 1);
        assert_eq!(io.read_all().unwrap(), &pattern(30)[..3]);
        assert_eq!(io.trim_capacity().unwrap(), 0);
        s.verify().unwrap();
    }

    #[test]
    fn trim_keeps_empty_head() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(2)).unwrap().ptr;
        let mut io = s.io(head);
        io.write_bytes(&pattern(10)).unwrap();
        io.set_size(0).unwrap();
        io.trim_capacity().unwrap();
        assert_eq!(io.chain_length().unwrap(), 1);
        assert_eq!(io.size().unwrap(), 0);
    }

    // -----------------------------------------------------------------------
    // std::io adapters
    // -----------------------------------------------------------------------

    #[test]
    fn std_io_traits() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(3)).unwrap().ptr;
        let mut io = s.io(head);
        io.write_all(b"hello world").unwrap();
        io.flush().unwrap();

        assert_eq!(io.seek(SeekFrom::End(-5)).unwrap(), 6);
        let mut tail = String::new();
        io.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "world");

        io.seek(SeekFrom::Start(0)).unwrap();
        io.seek(SeekFrom::Current(2)).unwrap();
        let mut buf = [0u8; 3];
        io.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"llo");
        assert_eq!(io.reference(), head.at(5));

        assert!(io.seek(SeekFrom::Current(-10)).is_err());
        assert_eq!(io.read_exact(&mut [0u8; 64]).unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn bit_streams_run_over_chains() {
        let mut s = store();
        let head = s.allocate(AllocateTicket::bytes(1)).unwrap().ptr;
        let bits: Vec<bool> = (0..100).map(|i| i % 3 == 0).collect();
        {
            let mut w = BitWriter::new(s.io(head));
            w.write_bits(&bits).unwrap();
            assert_eq!(w.finish().unwrap(), 100);
        }
        assert_eq!(s.io(head).size().unwrap(), 13);
        let mut r = BitReader::with_bit_count(s.io(head), 100).unwrap();
        assert_eq!(r.read_bits(100).unwrap(), bits);
    }

    // -----------------------------------------------------------------------
    // Randomised interleavings
    // -----------------------------------------------------------------------

    #[test]
    fn random_interleavings_match_model() {
        let mut rng = StdRng::seed_from_u64(0x5eed_c0de);
        let mut s = store();
        let mut chains: Vec<(ChunkPointer, Vec<u8>)> = (0..4)
            .map(|i| (s.allocate(AllocateTicket::bytes(i * 3)).unwrap().ptr, Vec::new()))
            .collect();

        for _ in 0..400 {
            let idx = rng.gen_range(0..chains.len());
            let (head, model) = &mut chains[idx];
            let mut io = s.io(*head);
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let pos = rng.gen_range(0..=model.len() + 4);
                    let data: Vec<u8> = (0..rng.gen_range(0..48)).map(|_| rng.gen()).collect();
                    io.set_position(pos as u64);
                    io.write_bytes(&data).unwrap();
                    if model.len() < pos + data.len() {
                        model.resize(pos.max(model.len()), 0);
                        model.truncate(pos);
                        model.extend_from_slice(&data);
                    } else {
                        model[pos..pos + data.len()].copy_from_slice(&data);
                    }
                }
                2 => {
                    let len = rng.gen_range(0..=model.len() + 16);
                    io.set_size(len as u64).unwrap();
                    model.resize(len, 0);
                }
                _ => {
                    io.trim_capacity().unwrap();
                }
            }
            let chain = s.chain(*head).unwrap();
            assert!(chain.iter().all(|c| c.size <= c.capacity));
            assert_eq!(&s.read_chain(*head).unwrap(), model);
        }
        s.verify().unwrap();

        for (head, model) in &chains {
            assert_eq!(&s.read_chain(*head).unwrap(), model);
        }
    }
}
