use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

/// Random-access byte medium a chunk store lives in.
///
/// All implementations must satisfy these invariants:
/// - `read_at` fails with `UnexpectedEof` rather than returning short data.
/// - `write_at` past the current end grows the medium.
/// - `set_size` truncates or zero-extends.
pub trait Medium: Send {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    fn set_size(&mut self, size: u64) -> io::Result<()>;

    /// Push buffered writes to durable storage. No-op by default.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn eof(offset: u64, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read of {len} bytes at {offset} past medium end {size}"),
    )
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// `Vec`-backed medium for tests and embedding.
#[derive(Clone, Debug, Default)]
pub struct MemoryMedium {
    data: Vec<u8>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Medium for MemoryMedium {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(eof(offset, buf.len(), self.data.len() as u64));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_size(&mut self, size: u64) -> io::Result<()> {
        self.data.resize(size as usize, 0);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Medium over a regular file using positioned reads and writes.
#[derive(Debug)]
pub struct FileMedium {
    path: PathBuf,
    file: File,
}

impl FileMedium {
    /// Open (or create) the file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Medium for FileMedium {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let size = self.size()?;
        if offset + buf.len() as u64 > size {
            return Err(eof(offset, buf.len(), size));
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

// ---------------------------------------------------------------------------
// Memory-mapped file
// ---------------------------------------------------------------------------

/// Medium over a memory-mapped file. Resizing remaps the file.
pub struct MappedMedium {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    len: u64,
}

impl MappedMedium {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let mut medium = Self {
            path: path.to_path_buf(),
            file,
            map: None,
            len,
        };
        medium.remap()?;
        Ok(medium)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remap(&mut self) -> io::Result<()> {
        self.map = if self.len == 0 {
            None
        } else {
            // SAFETY: the file is opened read-write by this process and is
            // only mutated through this medium while the map is alive.
            Some(unsafe { MmapMut::map_mut(&self.file)? })
        };
        Ok(())
    }
}

impl Medium for MappedMedium {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.len {
            return Err(eof(offset, buf.len(), self.len));
        }
        if let Some(map) = &self.map {
            buf.copy_from_slice(&map[offset as usize..end as usize]);
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let end = offset + data.len() as u64;
        if end > self.len {
            self.set_size(end)?;
        }
        if let Some(map) = &mut self.map {
            map[offset as usize..end as usize].copy_from_slice(data);
        }
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len)
    }

    fn set_size(&mut self, size: u64) -> io::Result<()> {
        if let Some(map) = self.map.take() {
            map.flush()?;
        }
        self.file.set_len(size)?;
        self.len = size;
        self.remap()
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MappedMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedMedium")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl<M: Medium + ?Sized> Medium for Box<M> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }

    fn set_size(&mut self, size: u64) -> io::Result<()> {
        (**self).set_size(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}
