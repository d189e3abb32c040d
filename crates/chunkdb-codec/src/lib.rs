//! Schema-driven codecs for chunkdb.
//!
//! A [`Schema`] names a struct's fields and their [`FieldType`]s. Compiling it
//! yields a [`StructPipe`]: one [`IoField`] per field plus a
//! [`BitFieldMerger`] that packs every sub-byte value of the record (null
//! flags, booleans, enum ordinals, width flags) into a shared bit group at
//! the front. Values whose size depends on their content carry *generated*
//! values (lengths, type ids, references) that are staged before the write.
//!
//! # Key Types
//!
//! - [`Schema`] / [`SchemaBuilder`] — field layout and its fingerprint
//! - [`Record`] / [`Value`] — dynamically typed field values
//! - [`StructPipe`] — stage, write, read, skip and free one record layout
//! - [`PipeCatalog`] — compiled pipes and known schemas by name
//! - [`Storable`] — map a Rust type to a record
//! - [`dynamic`] — self-describing values tagged with a registry id

pub mod catalog;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod field;
pub mod merger;
pub mod pipe;
pub mod schema;
pub mod storable;
pub mod value;

mod cursor;

pub use catalog::PipeCatalog;
pub use config::CodecConfig;
pub use error::{CodecError, CodecResult};
pub use field::{ElemCodec, IoField, Scalar, Slot};
pub use merger::{BitFieldMerger, BitMember, BitRole};
pub use pipe::{PipeFlavor, ReadCtx, Staged, StructPipe};
pub use schema::{EnumDef, FieldDef, FieldType, Nullability, Schema, SchemaBuilder};
pub use storable::Storable;
pub use value::{Record, Value};
