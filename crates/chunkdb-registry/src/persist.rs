//! Registry image format.
//!
//! ```text
//! [N bytes: bincode-serialized RegistryImage]
//! [4 bytes: CRC32 of the N bytes (little-endian u32)]
//! ```
//!
//! The image lives in an internal chunk chain; the chain head is recorded
//! by the caller (the database keeps it in the root chunk).

use std::collections::{BTreeMap, HashMap};

use chunkdb_store::{AllocateTicket, ChunkStore};
use chunkdb_types::ChunkPointer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::key::TypeKey;
use crate::registry::{TypeEntry, TypeRegistry};

const IMAGE_VERSION: u32 = 1;
const TRAILER_LEN: usize = 4;

#[derive(Serialize, Deserialize)]
struct RegistryImage {
    version: u32,
    next_id: u32,
    entries: Vec<TypeEntry>,
}

impl TypeRegistry {
    /// Serialize to the image format.
    pub fn to_image(&self) -> RegistryResult<Vec<u8>> {
        let image = RegistryImage {
            version: IMAGE_VERSION,
            next_id: self.next_id,
            entries: self.entries.values().cloned().collect(),
        };
        let mut bytes =
            bincode::serialize(&image).map_err(|e| RegistryError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Parse and validate an image produced by [`to_image`](Self::to_image).
    pub fn from_image(bytes: &[u8]) -> RegistryResult<Self> {
        if bytes.len() < TRAILER_LEN {
            return Err(RegistryError::Corrupt(format!(
                "image of {} bytes has no checksum trailer",
                bytes.len()
            )));
        }
        let (payload, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(RegistryError::ChecksumMismatch { expected, actual });
        }

        let image: RegistryImage =
            bincode::deserialize(payload).map_err(|e| RegistryError::Serialization(e.to_string()))?;
        if image.version != IMAGE_VERSION {
            return Err(RegistryError::Corrupt(format!(
                "unsupported image version {}",
                image.version
            )));
        }

        let mut registry = TypeRegistry {
            entries: BTreeMap::new(),
            ids: HashMap::new(),
            next_id: image.next_id,
            dirty: false,
        };
        for entry in image.entries {
            if entry.id >= image.next_id {
                return Err(RegistryError::Corrupt(format!(
                    "id {} not below next id {}",
                    entry.id, image.next_id
                )));
            }
            if registry.entries.contains_key(&entry.id) || registry.ids.contains_key(&entry.key) {
                return Err(RegistryError::Corrupt(format!(
                    "duplicate registration of {} as {}",
                    entry.key, entry.id
                )));
            }
            registry.insert(entry);
        }
        for (id, key) in TypeKey::BUILTINS.iter().enumerate() {
            if registry.lookup(key) != Some(id as u32) {
                return Err(RegistryError::Corrupt(format!("builtin {key} not at id {id}")));
            }
        }
        Ok(registry)
    }

    /// Write the registry into `store`.
    ///
    /// With a null `head` a new internal chain is allocated; otherwise the
    /// chain at `head` is rewritten in place and trimmed. Returns the chain
    /// head and clears the dirty flag.
    pub fn save(&mut self, store: &mut ChunkStore, head: ChunkPointer) -> RegistryResult<ChunkPointer> {
        let image = self.to_image()?;
        let len = image.len();
        let head = if head.is_null() {
            store.allocate(AllocateTicket::with_data(image).internal())?.ptr
        } else {
            let mut io = store.io(head);
            io.set_position(0);
            io.write_bytes(&image)?;
            io.set_size(len as u64)?;
            io.trim_capacity()?;
            head
        };
        self.dirty = false;
        debug!(types = self.len(), bytes = len, head = head.value(), "saved type registry");
        Ok(head)
    }

    /// Read a registry saved at `head`.
    pub fn load(store: &ChunkStore, head: ChunkPointer) -> RegistryResult<Self> {
        let bytes = store.read_chain(head)?;
        let registry = Self::from_image(&bytes)?;
        debug!(types = registry.len(), head = head.value(), "loaded type registry");
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    fn populated() -> TypeRegistry {
        let mut r = TypeRegistry::new();
        r.to_id_with_fingerprint(&TypeKey::struct_named("Point"), Fingerprint::of(b"p"), true)
            .unwrap();
        r.to_id(&TypeKey::enum_named("Color"), true).unwrap();
        r
    }

    fn same(a: &TypeRegistry, b: &TypeRegistry) -> bool {
        a.entries().eq(b.entries()) && a.peek_id(&TypeKey::struct_named("new")) == b.peek_id(&TypeKey::struct_named("new"))
    }

    #[test]
    fn image_roundtrip() {
        let r = populated();
        let back = TypeRegistry::from_image(&r.to_image().unwrap()).unwrap();
        assert!(same(&r, &back));
        assert!(!back.is_dirty());
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut image = populated().to_image().unwrap();
        image[3] ^= 0xFF;
        let err = TypeRegistry::from_image(&image).unwrap_err();
        assert!(matches!(err, RegistryError::ChecksumMismatch { .. }));
    }

    #[test]
    fn truncated_image_is_corrupt() {
        assert!(matches!(
            TypeRegistry::from_image(&[1, 2]),
            Err(RegistryError::Corrupt(_))
        ));
    }

    #[test]
    fn save_and_load_through_store() {
        let mut store = ChunkStore::in_memory().unwrap();
        let mut r = populated();
        assert!(r.is_dirty());
        let head = r.save(&mut store, ChunkPointer::NULL).unwrap();
        assert!(!r.is_dirty());
        assert!(!store.chunk(head).unwrap().flags.user_data);

        let loaded = TypeRegistry::load(&store, head).unwrap();
        assert!(same(&r, &loaded));
    }

    #[test]
    fn resave_rewrites_same_chain() {
        let mut store = ChunkStore::in_memory().unwrap();
        let mut r = populated();
        let head = r.save(&mut store, ChunkPointer::NULL).unwrap();

        for i in 0..50 {
            r.to_id(&TypeKey::struct_named(format!("Type{i}")), true).unwrap();
        }
        assert_eq!(r.save(&mut store, head).unwrap(), head);
        let loaded = TypeRegistry::load(&store, head).unwrap();
        assert_eq!(loaded.len(), r.len());
        assert_eq!(
            loaded.lookup(&TypeKey::struct_named("Type49")),
            r.lookup(&TypeKey::struct_named("Type49"))
        );
        store.verify().unwrap();
    }
}
