use std::io;

use thiserror::Error;

use crate::number_size::NumberSize;

/// Errors produced by type-level encode/decode operations.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("invalid number size ordinal: {0}")]
    InvalidNumberSize(u8),

    #[error("value {value} does not fit in {size:?}")]
    OutOfRange { value: i128, size: NumberSize },

    #[error("enum ordinal {ordinal} outside universe of {universe}")]
    InvalidEnumOrdinal { ordinal: u64, universe: usize },

    #[error("buffer too short: need {needed} bytes, have {actual}")]
    BufferTooShort { needed: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for type-level operations.
pub type TypeResult<T> = Result<T, TypeError>;
