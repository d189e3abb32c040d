use std::sync::Arc;

use crate::error::CodecResult;
use crate::schema::Schema;
use crate::value::Record;

/// A Rust type with an ahead-of-time schema.
///
/// Implementors convert to and from the [`Record`] form the struct pipes
/// encode. The schema must be the same on every call.
pub trait Storable: Sized {
    fn schema() -> Arc<Schema>;

    fn to_record(&self) -> CodecResult<Record>;

    fn from_record(record: &Record) -> CodecResult<Self>;
}
