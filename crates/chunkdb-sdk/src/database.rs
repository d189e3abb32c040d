use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use chunkdb_codec::{dynamic, CodecError, PipeCatalog, PipeFlavor, ReadCtx, Record, Schema, Storable, Value};
use chunkdb_registry::{TypeKey, TypeRegistry};
use chunkdb_store::{AllocateTicket, ChunkStore, DefragReport, FileMedium, Medium, MemoryMedium, MoveListener};
use chunkdb_types::{ChunkPointer, Reference};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{SdkError, SdkResult};

/// Root chunk contents: registry chain head, then the user root reference.
const ROOT_BLOCK_LEN: usize = 8 + Reference::ENCODED_LEN;

/// Every object starts with a layout tag and its `u32` LE type id.
const OBJECT_HEADER_LEN: u64 = 5;

/// How an object's body is encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    Record = 0,
    Fixed = 1,
    Dynamic = 2,
}

impl Layout {
    fn from_tag(at: Reference, tag: u8) -> SdkResult<Self> {
        match tag {
            0 => Ok(Self::Record),
            1 => Ok(Self::Fixed),
            2 => Ok(Self::Dynamic),
            tag => Err(SdkError::UnknownLayout { at, tag }),
        }
    }

    fn flavor(self) -> Option<PipeFlavor> {
        match self {
            Self::Record => Some(PipeFlavor::Contiguous),
            Self::Fixed => Some(PipeFlavor::Fixed),
            Self::Dynamic => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Fixed => "fixed-size record",
            Self::Dynamic => "dynamic value",
        }
    }

    fn header(self, type_id: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(OBJECT_HEADER_LEN as usize);
        out.push(self as u8);
        out.extend_from_slice(&type_id.to_le_bytes());
        out
    }
}

/// Reference to the body of the object at `at`.
fn body(at: Reference) -> Reference {
    Reference::new(at.ptr, at.offset + OBJECT_HEADER_LEN)
}

/// An embedded object database over one chunk store.
///
/// Owns the store, the type registry, and the schema catalog. The root chunk
/// holds the registry's chain head and one user-chosen root reference;
/// everything else is reachable from there. Registry changes reach the
/// medium on [`commit`](Self::commit).
///
/// After reopening, schemas must be registered again before records of
/// their type can be read: the store keeps type ids and fingerprints, not
/// layouts.
pub struct Database {
    store: ChunkStore,
    registry: TypeRegistry,
    catalog: PipeCatalog,
    config: DatabaseConfig,
    registry_head: ChunkPointer,
    root: Reference,
}

impl Database {
    /// Create a database on an empty medium.
    pub fn create<M: Medium + 'static>(medium: M, config: DatabaseConfig) -> SdkResult<Self> {
        let store = ChunkStore::create(medium, config.store.clone())?;
        let mut db = Self {
            store,
            registry: TypeRegistry::new(),
            catalog: PipeCatalog::new(),
            config,
            registry_head: ChunkPointer::NULL,
            root: Reference::NULL,
        };
        db.write_root_block()?;
        info!(size = db.store.medium_size(), "created database");
        Ok(db)
    }

    /// Open a database previously created on `medium`.
    pub fn open<M: Medium + 'static>(medium: M, config: DatabaseConfig) -> SdkResult<Self> {
        let store = ChunkStore::open(medium, config.store.clone())?;
        let block = store.read_chain(store.first_chunk()?.ptr)?;
        if block.len() < ROOT_BLOCK_LEN {
            return Err(SdkError::CorruptRoot(format!(
                "root block is {} bytes, need {ROOT_BLOCK_LEN}",
                block.len()
            )));
        }
        let mut head = [0u8; 8];
        head.copy_from_slice(&block[..8]);
        let mut root = [0u8; Reference::ENCODED_LEN];
        root.copy_from_slice(&block[8..ROOT_BLOCK_LEN]);
        let registry_head = ChunkPointer::new(u64::from_le_bytes(head));
        let root = Reference::from_bytes(&root);

        let registry = if registry_head.is_null() {
            TypeRegistry::new()
        } else {
            TypeRegistry::load(&store, registry_head)?
        };
        info!(
            size = store.medium_size(),
            types = registry.len(),
            root = ?root,
            "opened database"
        );
        Ok(Self {
            store,
            registry,
            catalog: PipeCatalog::new(),
            config,
            registry_head,
            root,
        })
    }

    pub fn open_or_create<M: Medium + 'static>(medium: M, config: DatabaseConfig) -> SdkResult<Self> {
        if medium.size()? == 0 {
            Self::create(medium, config)
        } else {
            Self::open(medium, config)
        }
    }

    /// Open the database file at `path`, creating it if missing or empty.
    pub fn open_file(path: impl AsRef<Path>, config: DatabaseConfig) -> SdkResult<Self> {
        Self::open_or_create(FileMedium::open(path.as_ref())?, config)
    }

    pub fn in_memory() -> SdkResult<Self> {
        Self::create(MemoryMedium::new(), DatabaseConfig::default())
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &PipeCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Persist the registry if it changed and flush the medium.
    pub fn commit(&mut self) -> SdkResult<()> {
        if self.registry.is_dirty() {
            let head = self.registry.save(&mut self.store, self.registry_head)?;
            if head != self.registry_head {
                self.registry_head = head;
                self.write_root_block()?;
            }
        }
        self.store.flush()?;
        debug!(types = self.registry.len(), size = self.store.medium_size(), "committed");
        Ok(())
    }

    /// Commit and hand back the medium.
    pub fn close(mut self) -> SdkResult<Box<dyn Medium>> {
        self.commit()?;
        Ok(self.store.into_medium())
    }

    fn write_root_block(&mut self) -> SdkResult<()> {
        let mut block = Vec::with_capacity(ROOT_BLOCK_LEN);
        block.extend_from_slice(&self.registry_head.value().to_le_bytes());
        block.extend_from_slice(&self.root.to_bytes());
        let first = self.store.first_chunk()?.ptr;
        let mut io = self.store.io(first);
        io.set_position(0);
        io.write_bytes(&block)?;
        Ok(())
    }

    /// The user root, if one is set.
    pub fn root(&self) -> Option<Reference> {
        (!self.root.is_null()).then_some(self.root)
    }

    pub fn set_root(&mut self, at: Reference) -> SdkResult<()> {
        self.root = at;
        self.write_root_block()
    }

    pub fn clear_root(&mut self) -> SdkResult<()> {
        self.set_root(Reference::NULL)
    }

    // -----------------------------------------------------------------------
    // Schemas
    // -----------------------------------------------------------------------

    /// Make `schema` (and the schemas it nests) known, returning its type id.
    ///
    /// Fails with a fingerprint mismatch if the store already holds records
    /// of a type with this name and a different layout.
    pub fn register_schema(&mut self, schema: Arc<Schema>) -> SdkResult<u32> {
        self.catalog.register(schema.clone())?;
        let id = self.registry.to_id_with_fingerprint(
            &TypeKey::struct_named(schema.name()),
            schema.fingerprint(),
            self.config.codec.allow_register,
        )?;
        Ok(id)
    }

    pub fn register<T: Storable>(&mut self) -> SdkResult<u32> {
        self.register_schema(T::schema())
    }

    fn schema_of(&self, at: Reference, type_id: u32) -> SdkResult<Arc<Schema>> {
        match self.registry.from_id(type_id)? {
            TypeKey::Struct(name) => {
                let schema = self
                    .catalog
                    .schema(name)
                    .cloned()
                    .ok_or_else(|| CodecError::UnknownSchema(name.clone()))?;
                self.registry.check_fingerprint(type_id, schema.fingerprint())?;
                Ok(schema)
            }
            other => Err(SdkError::WrongType {
                at,
                expected: "struct".into(),
                actual: other.to_string(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    fn allocate_object(&mut self, bytes: Vec<u8>, layout: Layout) -> SdkResult<Reference> {
        let len = bytes.len();
        let chunk = self.store.allocate(AllocateTicket::with_data(bytes))?;
        debug!(ptr = chunk.ptr.value(), len, layout = layout.name(), "stored object");
        Ok(chunk.ptr.at(0))
    }

    fn put_with(&mut self, record: &Record, layout: Layout, flavor: PipeFlavor) -> SdkResult<Reference> {
        let schema = record.schema().clone();
        let type_id = self.register_schema(schema.clone())?;
        let pipe = self.catalog.compile(&schema, flavor)?;
        let (body, staged) = pipe.encode_staged(record, &mut self.registry, &mut self.store, &self.config.codec)?;
        let mut bytes = layout.header(type_id);
        bytes.extend(body);
        match self.allocate_object(bytes, layout) {
            Ok(at) => Ok(at),
            Err(e) => Err(pipe.abandon(&staged, &mut self.store, e)),
        }
    }

    /// Store `record` in its own chunk.
    pub fn put_record(&mut self, record: &Record) -> SdkResult<Reference> {
        self.put_with(record, Layout::Record, PipeFlavor::Contiguous)
    }

    /// Store `record` with the fixed-size layout, so it can later be
    /// overwritten with [`update_in_place`](Self::update_in_place).
    pub fn put_fixed(&mut self, record: &Record) -> SdkResult<Reference> {
        self.put_with(record, Layout::Fixed, PipeFlavor::Fixed)
    }

    pub fn put<T: Storable>(&mut self, value: &T) -> SdkResult<Reference> {
        self.put_record(&value.to_record()?)
    }

    /// Store a self-describing value of any shape.
    pub fn put_dynamic(&mut self, value: &Value) -> SdkResult<Reference> {
        self.catalog.remember_value(value)?;
        let type_id = dynamic::stage(value, &mut self.registry, self.config.codec.allow_register)?;
        let mut bytes = Layout::Dynamic.header(type_id);
        dynamic::write_payload(value, &self.registry, &mut bytes)?;
        self.allocate_object(bytes, Layout::Dynamic)
    }

    /// The bytes of the chain holding `at` and the header of its object.
    fn read_object(&self, at: Reference) -> SdkResult<(Layout, u32, Vec<u8>)> {
        let bytes = self.store.read_chain(at.ptr)?;
        let start = at.offset as usize;
        let header = bytes
            .get(start..start + OBJECT_HEADER_LEN as usize)
            .ok_or(SdkError::NotAnObject(at))?;
        let layout = Layout::from_tag(at, header[0])?;
        let type_id = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        Ok((layout, type_id, bytes))
    }

    fn ctx(&self) -> ReadCtx<'_> {
        ReadCtx {
            store: &self.store,
            registry: &self.registry,
            catalog: &self.catalog,
            config: &self.config.codec,
        }
    }

    fn record_flavor(at: Reference, layout: Layout) -> SdkResult<PipeFlavor> {
        layout.flavor().ok_or_else(|| SdkError::WrongType {
            at,
            expected: "record".into(),
            actual: layout.name().into(),
        })
    }

    /// Read the record stored at `at`. Its schema must be registered.
    pub fn get_record(&mut self, at: Reference) -> SdkResult<Record> {
        let (layout, type_id, bytes) = self.read_object(at)?;
        let flavor = Self::record_flavor(at, layout)?;
        let schema = self.schema_of(at, type_id)?;
        let pipe = self.catalog.compile(&schema, flavor)?;
        let mut input = Cursor::new(bytes.as_slice());
        input.set_position(body(at).offset);
        Ok(pipe.decode(&mut input, &self.ctx())?)
    }

    pub fn get<T: Storable>(&mut self, at: Reference) -> SdkResult<T> {
        let schema = T::schema();
        self.catalog.register(schema.clone())?;
        let record = self.get_record(at)?;
        if record.schema().fingerprint() != schema.fingerprint() {
            return Err(SdkError::WrongType {
                at,
                expected: schema.name().to_string(),
                actual: record.schema().name().to_string(),
            });
        }
        Ok(T::from_record(&record)?)
    }

    /// Read one field of the record at `at`, skipping the others.
    pub fn get_field(&mut self, at: Reference, field: &str) -> SdkResult<Option<Value>> {
        let (layout, type_id, bytes) = self.read_object(at)?;
        let flavor = Self::record_flavor(at, layout)?;
        let schema = self.schema_of(at, type_id)?;
        let pipe = self.catalog.compile(&schema, flavor)?;
        let mut input = Cursor::new(bytes.as_slice());
        input.set_position(body(at).offset);
        Ok(pipe.read_field(&mut input, field, &self.ctx())?)
    }

    pub fn get_dynamic(&self, at: Reference) -> SdkResult<Value> {
        let (layout, type_id, bytes) = self.read_object(at)?;
        if layout != Layout::Dynamic {
            return Err(SdkError::WrongType {
                at,
                expected: Layout::Dynamic.name().into(),
                actual: layout.name().into(),
            });
        }
        let mut input = Cursor::new(bytes.as_slice());
        input.set_position(body(at).offset);
        Ok(dynamic::read_payload(&mut input, type_id, &self.ctx())?)
    }

    /// Overwrite the fixed-size record at `at`.
    pub fn update_in_place(&mut self, at: Reference, record: &Record) -> SdkResult<()> {
        let (layout, type_id, _) = self.read_object(at)?;
        if layout != Layout::Fixed {
            return Err(SdkError::InvalidOperation(format!(
                "object at {at:?} is a {} and cannot be overwritten in place",
                layout.name()
            )));
        }
        let schema = self.schema_of(at, type_id)?;
        let pipe = self.catalog.compile(&schema, PipeFlavor::Fixed)?;
        pipe.write_in_place(record, body(at), &mut self.store, &mut self.registry, &self.config.codec)?;
        Ok(())
    }

    /// Free the object at `at` and every chain its fields own.
    pub fn free(&mut self, at: Reference) -> SdkResult<()> {
        let (layout, type_id, _) = self.read_object(at)?;
        let mut owned = 0;
        if let Some(flavor) = layout.flavor() {
            let schema = self.schema_of(at, type_id)?;
            let pipe = self.catalog.compile(&schema, flavor)?;
            owned = pipe.free_out_of_line(&mut self.store, body(at))?;
        }
        self.store.free_chain(at.ptr)?;
        debug!(ptr = at.ptr.value(), owned, "freed object");
        if self.root.ptr == at.ptr {
            self.clear_root()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Consolidate fragmented chains.
    ///
    /// The registry head and the root reference are rebased here; every move
    /// is also forwarded to `listener` for references the caller holds.
    pub fn defragment<L: MoveListener + ?Sized>(&mut self, listener: &mut L) -> SdkResult<DefragReport> {
        let mut registry_head = self.registry_head;
        let mut root = self.root;
        let report = self.store.defragment(&mut |from: ChunkPointer, to: ChunkPointer| {
            if registry_head == from {
                registry_head = to;
            }
            root.rebase(from, to);
            listener.chunk_moved(from, to);
        })?;
        if registry_head != self.registry_head || root != self.root {
            self.registry_head = registry_head;
            self.root = root;
            self.write_root_block()?;
        }
        info!(
            moved = report.moved,
            before = report.medium_size_before,
            after = report.medium_size_after,
            "defragmented database"
        );
        Ok(report)
    }

    /// Check the store's accounting invariants.
    pub fn verify(&self) -> SdkResult<()> {
        self.store.verify()?;
        Ok(())
    }
}
