use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::fingerprint::Fingerprint;
use crate::key::TypeKey;

/// One registered type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub id: u32,
    pub key: TypeKey,
    /// Schema fingerprint for struct types, recorded on first registration.
    pub fingerprint: Option<Fingerprint>,
}

/// Bidirectional map between types and compact ids.
///
/// Ids are assigned once and never reused or renumbered, so they stay valid
/// for the whole life of the store the registry is persisted in. There is no
/// global instance: the registry is passed explicitly to every codec call
/// that needs it.
#[derive(Clone, Debug)]
pub struct TypeRegistry {
    pub(crate) entries: BTreeMap<u32, TypeEntry>,
    pub(crate) ids: HashMap<TypeKey, u32>,
    pub(crate) next_id: u32,
    pub(crate) dirty: bool,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry holding only the builtin kinds.
    pub fn new() -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
            ids: HashMap::new(),
            next_id: TypeKey::FIRST_USER_ID,
            dirty: false,
        };
        for (id, key) in TypeKey::BUILTINS.iter().enumerate() {
            registry.insert(TypeEntry {
                id: id as u32,
                key: key.clone(),
                fingerprint: None,
            });
        }
        registry
    }

    pub(crate) fn insert(&mut self, entry: TypeEntry) {
        self.ids.insert(entry.key.clone(), entry.id);
        self.entries.insert(entry.id, entry);
    }

    /// Id of `key` if it is registered.
    pub fn lookup(&self, key: &TypeKey) -> Option<u32> {
        self.ids.get(key).copied()
    }

    /// The id `key` has, or the id it would receive if registered now.
    ///
    /// Size computations use this to pick id widths without mutating the
    /// registry.
    pub fn peek_id(&self, key: &TypeKey) -> u32 {
        self.lookup(key).unwrap_or(self.next_id)
    }

    /// Id of `key`, registering it if unseen and `allow_register` is set.
    pub fn to_id(&mut self, key: &TypeKey, allow_register: bool) -> RegistryResult<u32> {
        if let Some(id) = self.lookup(key) {
            return Ok(id);
        }
        if !allow_register {
            return Err(RegistryError::UnknownType(key.clone()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.insert(TypeEntry {
            id,
            key: key.clone(),
            fingerprint: None,
        });
        self.dirty = true;
        debug!(id, key = %key, "registered type");
        Ok(id)
    }

    /// Like [`to_id`](Self::to_id), and also records `fingerprint` on first
    /// sight or checks it against the recorded one.
    pub fn to_id_with_fingerprint(
        &mut self,
        key: &TypeKey,
        fingerprint: Fingerprint,
        allow_register: bool,
    ) -> RegistryResult<u32> {
        let id = self.to_id(key, allow_register)?;
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(RegistryError::UnknownTypeId(id))?;
        match entry.fingerprint {
            None => {
                entry.fingerprint = Some(fingerprint);
                self.dirty = true;
                Ok(id)
            }
            Some(stored) if stored != fingerprint => Err(RegistryError::FingerprintMismatch {
                key: key.clone(),
                stored,
                current: fingerprint,
            }),
            Some(_) => Ok(id),
        }
    }

    /// Check `fingerprint` against the one recorded for `id`. Types
    /// registered without a fingerprint always pass.
    pub fn check_fingerprint(&self, id: u32, fingerprint: Fingerprint) -> RegistryResult<()> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownTypeId(id))?;
        match entry.fingerprint {
            Some(stored) if stored != fingerprint => {
                warn!(id, key = %entry.key, stored = %stored, current = %fingerprint, "schema drift");
                Err(RegistryError::FingerprintMismatch {
                    key: entry.key.clone(),
                    stored,
                    current: fingerprint,
                })
            }
            _ => Ok(()),
        }
    }

    /// The type registered under `id`.
    pub fn from_id(&self, id: u32) -> RegistryResult<&TypeKey> {
        self.entries
            .get(&id)
            .map(|e| &e.key)
            .ok_or(RegistryError::UnknownTypeId(id))
    }

    pub fn entry(&self, id: u32) -> Option<&TypeEntry> {
        self.entries.get(&id)
    }

    /// All entries in id order, builtins first.
    pub fn entries(&self) -> impl Iterator<Item = &TypeEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` if types were registered since the last save or load.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}
