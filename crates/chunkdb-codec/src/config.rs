use serde::{Deserialize, Serialize};

/// Codec behaviour switches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Re-measure every field after writing it and fail on any disagreement
    /// with its size descriptor.
    pub validate: bool,
    /// Register unseen struct, enum, and builtin types while writing.
    pub allow_register: bool,
    /// Decode values of unknown type ids as [`Value::Unknown`](crate::Value::Unknown)
    /// instead of failing.
    pub lenient_reads: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            validate: true,
            allow_register: true,
            lenient_reads: false,
        }
    }
}
