use chunkdb_types::Reference;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] chunkdb_store::StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] chunkdb_registry::RegistryError),

    #[error("codec error: {0}")]
    Codec(#[from] chunkdb_codec::CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The root chunk does not hold a database root block.
    #[error("corrupt database root: {0}")]
    CorruptRoot(String),

    #[error("no object header at {0:?}")]
    NotAnObject(Reference),

    #[error("object at {at:?} has unknown layout tag {tag}")]
    UnknownLayout { at: Reference, tag: u8 },

    #[error("object at {at:?} is {actual}, expected {expected}")]
    WrongType {
        at: Reference,
        expected: String,
        actual: String,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

pub type SdkResult<T> = Result<T, SdkError>;
