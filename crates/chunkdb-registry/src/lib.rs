//! Type registry for chunkdb.
//!
//! Maps the types a store holds (builtin value kinds, named structs and
//! enums) to small integer ids that are written in place of type names.
//! Ids are stable for the life of a store; the registry persists itself
//! into an internal chunk chain.
//!
//! # Key Types
//!
//! - [`TypeRegistry`] — bidirectional key ↔ id map with dirty tracking
//! - [`TypeKey`] — what an id stands for
//! - [`Fingerprint`] — BLAKE3 digest of a schema, checked on read

pub mod error;
pub mod fingerprint;
pub mod key;
pub mod persist;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use fingerprint::Fingerprint;
pub use key::TypeKey;
pub use registry::{TypeEntry, TypeRegistry};
