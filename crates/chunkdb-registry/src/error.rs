use chunkdb_store::StoreError;
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::key::TypeKey;

/// Errors from type registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No type is registered under this id. Recoverable: a reader may skip
    /// or stub the value.
    #[error("unknown type id: {0}")]
    UnknownTypeId(u32),

    /// The key is not registered and registration was not allowed.
    #[error("type not registered: {0}")]
    UnknownType(TypeKey),

    /// A struct's schema differs from the one recorded when it was
    /// registered.
    #[error("schema fingerprint mismatch for {key}: stored {stored}, current {current}")]
    FingerprintMismatch {
        key: TypeKey,
        stored: Fingerprint,
        current: Fingerprint,
    },

    #[error("registry image checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("corrupt registry image: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// `true` when a read can continue past the failing value.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownTypeId(_))
    }
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
