//! Foundation types for chunkdb.
//!
//! Every other chunkdb crate depends on `chunkdb-types`. The types here carry
//! no storage state of their own; they describe how numbers, bits, and
//! positions are laid out on the medium.
//!
//! # Key Types
//!
//! - [`NumberSize`] — the ladder of fixed integer widths used for
//!   variable-width numeric storage
//! - [`ChunkPointer`] — byte offset of a chunk header, or null
//! - [`Reference`] — a chunk pointer plus a byte offset into its chain
//! - [`BitWriter`] / [`BitReader`] — LSB-first bit streams over byte I/O
//! - [`SizeDescriptor`] — fixed or computed size contract for codecs

pub mod bits;
pub mod error;
pub mod number_size;
pub mod pointer;
pub mod size;

pub use bits::{bits_for_universe, bytes_for_bits, BitReader, BitWriter};
pub use error::{TypeError, TypeResult};
pub use number_size::NumberSize;
pub use pointer::{ChunkPointer, Reference};
pub use size::{SizeDescriptor, SizeFn, WordSpace};
