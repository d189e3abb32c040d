use chunkdb_registry::RegistryError;
use chunkdb_store::StoreError;
use chunkdb_types::TypeError;
use thiserror::Error;

/// Errors from schema compilation, encoding, and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] TypeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A field wrote a different number of bytes than its size descriptor
    /// promised. Always a codec bug.
    #[error("size mismatch in field {field}: expected {expected}, wrote {actual}")]
    SizeMismatch {
        field: String,
        expected: u64,
        actual: u64,
    },

    /// A not-null field was assigned no value.
    #[error("field {schema}.{field} is not nullable")]
    NullViolation { schema: String, field: String },

    #[error("field {field} expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("schema {schema} has no field {field}")]
    UnknownField { schema: String, field: String },

    #[error("no schema registered under {0}")]
    UnknownSchema(String),

    #[error("pipe for {expected} cannot handle a record of {actual}")]
    SchemaMismatch { expected: String, actual: String },

    #[error("schema {0} is already registered with a different layout")]
    SchemaConflict(String),

    /// A schema uses a field shape its pipe flavor cannot hold.
    #[error("field {schema}.{field} is not supported here: {reason}")]
    UnsupportedField {
        schema: String,
        field: String,
        reason: String,
    },

    /// An out-of-line field was written before its reference was staged.
    #[error("reference for field {field} has not been allocated")]
    ReferenceNotAllocated { field: String },

    #[error("generated {what} for field {field} has not been staged")]
    MissingGenerated { field: String, what: &'static str },

    #[error("invalid encoded value: {0}")]
    InvalidValue(String),
}

impl CodecError {
    /// `true` for errors a reader can step past: unknown type ids and
    /// damaged on-medium structure.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_recoverable(),
            Self::Store(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
