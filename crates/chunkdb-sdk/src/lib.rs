//! Embedding API for chunkdb.
//!
//! Ties the chunk store, the type registry, and the codec catalog together
//! behind one [`Database`] handle. The registry is persisted in the store
//! itself, so a medium carries everything needed to read its objects back
//! once their schemas are registered again.
//!
//! # Key Types
//!
//! - [`Database`] — open or create, put and get objects, commit, defragment
//! - [`DatabaseConfig`] — store and codec settings, loadable from TOML

pub mod config;
pub mod database;
pub mod error;

pub use config::DatabaseConfig;
pub use database::Database;
pub use error::{SdkError, SdkResult};

pub use chunkdb_codec::{
    CodecConfig, EnumDef, FieldType, Nullability, Record, Schema, SchemaBuilder, Storable, Value,
};
pub use chunkdb_store::{FileMedium, MappedMedium, Medium, MemoryMedium, MoveListener, StoreConfig};
pub use chunkdb_types::{ChunkPointer, Reference};
