//! Chunk store for chunkdb.
//!
//! A store lays variable-sized chunks end to end over a random-access byte
//! [`Medium`]. Each chunk has a small header (capacity, logical size, an
//! optional pointer to the next chunk of its chain) followed by its data.
//! Values larger than one chunk live in chains that grow transparently
//! through [`ChainIo`].
//!
//! # Key Types
//!
//! - [`ChunkStore`] — allocator, free list, chain growth, defragmentation
//! - [`AllocateTicket`] — a single allocation request
//! - [`ChainIo`] — positioned `Read + Write + Seek` cursor over a chain
//! - [`Medium`] — the backing bytes: [`MemoryMedium`], [`FileMedium`],
//!   [`MappedMedium`]

pub mod chain;
pub mod chunk;
pub mod config;
pub mod error;
pub mod medium;
pub mod store;
pub mod ticket;

pub use chain::ChainIo;
pub use chunk::{Chunk, ChunkFlags, STORE_HEADER_LEN, STORE_MAGIC, STORE_VERSION};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use medium::{FileMedium, MappedMedium, Medium, MemoryMedium};
pub use store::{ChunkStore, Chunks, DefragReport, MoveListener};
pub use ticket::{AllocateTicket, PopulateFn};
