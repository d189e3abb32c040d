use chunkdb_codec::CodecConfig;
use chunkdb_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

/// Settings for a [`Database`](crate::Database).
///
/// ```toml
/// [store]
/// root_capacity = 128
///
/// [codec]
/// lenient_reads = true
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub store: StoreConfig,
    pub codec: CodecConfig,
}

impl DatabaseConfig {
    pub fn from_toml_str(s: &str) -> SdkResult<Self> {
        toml::from_str(s).map_err(|e| SdkError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> SdkResult<String> {
        toml::to_string(self).map_err(|e| SdkError::Config(e.to_string()))
    }
}
