use chunkdb_types::NumberSize;
use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`ChunkStore`](crate::ChunkStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Narrowest width reserved for the next pointer of a new chunk. New
    /// chunks get a wider one when the medium is already too large for it;
    /// an existing chunk whose pointer cannot reach a newly linked chunk has
    /// its header widened in place when its chain grows.
    pub next_pointer_size: NumberSize,
    /// A best-fit free chunk is split when the surplus can hold a header plus
    /// at least this many data bytes.
    pub min_split_capacity: u64,
    /// Capacity of the first (root) chunk written when a store is created.
    pub root_capacity: u64,
    /// Merge physically adjacent free chunks on free.
    pub coalesce_free: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            next_pointer_size: NumberSize::Int,
            min_split_capacity: 8,
            root_capacity: 64,
            coalesce_free: true,
        }
    }
}
