use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use chunkdb_registry::{Fingerprint, TypeRegistry};
use chunkdb_store::{ChainIo, ChunkStore};
use chunkdb_types::{ChunkPointer, NumberSize, Reference, SizeDescriptor, WordSpace};
use tracing::{debug, warn};

use crate::catalog::PipeCatalog;
use crate::config::CodecConfig;
use crate::cursor::skip;
use crate::error::{CodecError, CodecResult};
use crate::field::{FieldBits, IoField, Slot};
use crate::merger::{BitFieldMerger, BitRole};
use crate::schema::{Nullability, Schema};
use crate::value::{Record, Value};

/// Layout family of a compiled pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipeFlavor {
    /// Fields back to back; null fields take no payload bytes.
    Contiguous,
    /// Every field at a fixed size, null payloads zero-filled. Supports
    /// in-place overwrite.
    Fixed,
}

/// What a read needs besides the bytes.
#[derive(Clone, Copy)]
pub struct ReadCtx<'a> {
    /// Resolves out-of-line references.
    pub store: &'a ChunkStore,
    pub registry: &'a TypeRegistry,
    /// Resolves struct schemas inside dynamic values.
    pub catalog: &'a PipeCatalog,
    pub config: &'a CodecConfig,
}

/// Generated values of one record, staged before writing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Staged {
    pub(crate) slots: Vec<Slot>,
}

impl Staged {
    /// Nothing staged. Writing with it fails on the first generated value.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

fn slot_at<'a>(staged: &'a Staged, empty: &'a Slot, index: usize) -> &'a Slot {
    staged.slots.get(index).unwrap_or(empty)
}

struct CompiledField {
    name: String,
    nullability: Nullability,
    codec: Arc<IoField>,
    size: SizeDescriptor<TypeRegistry, Record>,
}

/// Compiled codec for one schema.
///
/// Layout: the bit group, then each field's byte part in declaration order.
/// Pipes are immutable once built and shared through `Arc`.
pub struct StructPipe {
    schema: Arc<Schema>,
    flavor: PipeFlavor,
    merger: BitFieldMerger,
    fields: Vec<CompiledField>,
    size: SizeDescriptor<TypeRegistry, Record>,
}

impl fmt::Debug for StructPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructPipe")
            .field("schema", &self.schema.name())
            .field("flavor", &self.flavor)
            .field("bits", &self.merger.total_bits())
            .field("size", &self.size)
            .finish()
    }
}

impl StructPipe {
    /// Compile `schema` and everything it nests, without a shared catalog.
    pub fn compile(schema: &Arc<Schema>, flavor: PipeFlavor) -> CodecResult<Arc<Self>> {
        PipeCatalog::new().compile(schema, flavor)
    }

    /// Assemble a pipe from codecs compiled for each field of `schema`.
    pub(crate) fn new(schema: Arc<Schema>, flavor: PipeFlavor, codecs: Vec<IoField>) -> Self {
        let mut merger = BitFieldMerger::new();
        let mut fields = Vec::with_capacity(codecs.len());

        for (index, (def, codec)) in schema.fields().iter().zip(codecs).enumerate() {
            if def.nullability == Nullability::Nullable {
                merger.push(index, BitRole::Null, 1);
            }
            for (role, bits) in codec.bit_members() {
                merger.push(index, role, bits);
            }

            let codec = Arc::new(codec);
            let nullable = def.nullability == Nullability::Nullable;
            let size = match (flavor, codec.fixed_size()) {
                (PipeFlavor::Fixed, Some(n)) => SizeDescriptor::fixed(WordSpace::Byte, n),
                (PipeFlavor::Contiguous, Some(n)) if !nullable || n == 0 => SizeDescriptor::fixed(WordSpace::Byte, n),
                (_, max) => {
                    let c = codec.clone();
                    SizeDescriptor::unknown(WordSpace::Byte, 0, max, move |registry: &TypeRegistry, record: &Record| {
                        record
                            .values()
                            .get(index)
                            .and_then(Option::as_ref)
                            .map_or(0, |v| c.size(v, registry))
                    })
                }
            };
            fields.push(CompiledField {
                name: def.name.clone(),
                nullability: def.nullability,
                codec,
                size,
            });
        }

        let size = SizeDescriptor::sum(
            std::iter::once(merger.size_descriptor()).chain(fields.iter().map(|f| f.size.clone())),
        );
        Self {
            schema,
            flavor,
            merger,
            fields,
            size,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn flavor(&self) -> PipeFlavor {
        self.flavor
    }

    pub fn merger(&self) -> &BitFieldMerger {
        &self.merger
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.schema.fingerprint()
    }

    pub fn size(&self) -> &SizeDescriptor<TypeRegistry, Record> {
        &self.size
    }

    pub fn fixed_size(&self) -> Option<u64> {
        self.size.fixed_size()
    }

    /// Encoded size of `record`. Exact once the record is staged; before
    /// that, types not yet registered are sized at the next free id.
    pub fn size_of(&self, record: &Record, registry: &TypeRegistry) -> u64 {
        self.size.calc_in(WordSpace::Byte, registry, record)
    }

    fn check_schema(&self, record: &Record) -> CodecResult<()> {
        if record.schema().fingerprint() != self.schema.fingerprint() {
            return Err(CodecError::SchemaMismatch {
                expected: self.schema.name().to_string(),
                actual: record.schema().name().to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Compute every generated value of `record`, registering types and
    /// allocating out-of-line chains in `store`.
    ///
    /// On failure every chain allocated so far is freed again. Types
    /// registered along the way stay registered.
    pub fn stage(
        &self,
        record: &Record,
        registry: &mut TypeRegistry,
        store: &mut ChunkStore,
        config: &CodecConfig,
    ) -> CodecResult<Staged> {
        self.check_schema(record)?;
        let mut staged = Staged {
            slots: Vec::with_capacity(self.fields.len()),
        };
        for (field, value) in self.fields.iter().zip(record.values()) {
            let slot = match value {
                Some(v) => match field.codec.stage(&field.name, v, registry, store, config) {
                    Ok(slot) => slot,
                    Err(e) => return Err(self.abandon(&staged, store, e)),
                },
                None => Slot::default(),
            };
            staged.slots.push(slot);
        }
        Ok(staged)
    }

    /// Free every chain allocated while staging, recursively. For a record
    /// that was never written, or whose write failed. Returns the number of
    /// chains freed.
    pub fn release(&self, staged: &Staged, store: &mut ChunkStore) -> CodecResult<usize> {
        let mut freed = 0;
        for (field, slot) in self.fields.iter().zip(&staged.slots) {
            freed += field.codec.release(slot, store)?;
        }
        if freed > 0 {
            debug!(schema = self.schema.name(), chains = freed, "released staged chains");
        }
        Ok(freed)
    }

    /// [`release`](Self::release) `staged` after a failed write and hand back
    /// the error that caused it.
    pub fn abandon<E>(&self, staged: &Staged, store: &mut ChunkStore, cause: E) -> E {
        if let Err(e) = self.release(staged, store) {
            warn!(schema = self.schema.name(), error = %e, "could not release staged chains");
        }
        cause
    }

    /// Write `record` using previously staged generated values.
    pub fn write_staged(
        &self,
        record: &Record,
        staged: &Staged,
        registry: &TypeRegistry,
        config: &CodecConfig,
        out: &mut Vec<u8>,
    ) -> CodecResult<()> {
        self.check_schema(record)?;
        let empty = Slot::default();
        let values = record.values();

        let mut bits = Vec::with_capacity(self.merger.members().len());
        for m in self.merger.members() {
            let field = &self.fields[m.field];
            bits.push(match (m.role, &values[m.field]) {
                (BitRole::Null, v) => u64::from(v.is_none()),
                (_, None) => 0,
                (role, Some(v)) => field.codec.bit_value(&field.name, role, v, slot_at(staged, &empty, m.field))?,
            });
        }
        let start = out.len();
        self.merger.write(&mut *out, &bits)?;
        self.check_written(config, "(bit group)", self.merger.byte_len(), start, out)?;

        for (i, field) in self.fields.iter().enumerate() {
            let start = out.len();
            match &values[i] {
                Some(v) => field.codec.write(&field.name, v, slot_at(staged, &empty, i), registry, config, out)?,
                None if field.nullability != Nullability::Nullable => {
                    return Err(CodecError::NullViolation {
                        schema: self.schema.name().to_string(),
                        field: field.name.clone(),
                    })
                }
                None => {
                    if self.flavor == PipeFlavor::Fixed {
                        let n = field.codec.fixed_size().unwrap_or(0);
                        out.resize(out.len() + n as usize, 0);
                    }
                }
            }
            if config.validate {
                let expected = field.size.calc_in(WordSpace::Byte, registry, record);
                self.check_written(config, &field.name, expected, start, out)?;
            }
        }
        Ok(())
    }

    fn check_written(&self, config: &CodecConfig, field: &str, expected: u64, start: usize, out: &[u8]) -> CodecResult<()> {
        let actual = (out.len() - start) as u64;
        if config.validate && actual != expected {
            return Err(CodecError::SizeMismatch {
                field: format!("{}.{field}", self.schema.name()),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Stage and write `record` into a fresh buffer.
    pub fn encode(
        &self,
        record: &Record,
        registry: &mut TypeRegistry,
        store: &mut ChunkStore,
        config: &CodecConfig,
    ) -> CodecResult<Vec<u8>> {
        self.encode_staged(record, registry, store, config).map(|(bytes, _)| bytes)
    }

    /// Like [`encode`](Self::encode), also returning what was staged so a
    /// caller whose next step fails can [`abandon`](Self::abandon) it.
    pub fn encode_staged(
        &self,
        record: &Record,
        registry: &mut TypeRegistry,
        store: &mut ChunkStore,
        config: &CodecConfig,
    ) -> CodecResult<(Vec<u8>, Staged)> {
        let staged = self.stage(record, registry, store, config)?;
        let mut out = Vec::with_capacity(self.size_of(record, registry) as usize);
        match self.write_staged(record, &staged, registry, config, &mut out) {
            Ok(()) => Ok((out, staged)),
            Err(e) => Err(self.abandon(&staged, store, e)),
        }
    }

    /// Encode `record` at the cursor of `io`.
    pub fn write(
        &self,
        record: &Record,
        io: &mut ChainIo<'_>,
        registry: &mut TypeRegistry,
        config: &CodecConfig,
    ) -> CodecResult<()> {
        let (bytes, staged) = self.encode_staged(record, registry, io.store(), config)?;
        if let Err(e) = io.write_bytes(&bytes) {
            return Err(self.abandon(&staged, io.store(), e.into()));
        }
        Ok(())
    }

    /// Overwrite the record stored at `at` with `record`.
    ///
    /// Only fixed-size pipes can do this: the new encoding takes exactly the
    /// bytes of the old one. Chains owned by the old record are freed once
    /// the new bytes have landed; if anything fails before that, the new
    /// record's chains are freed and the old record is left as it was.
    pub fn write_in_place(
        &self,
        record: &Record,
        at: Reference,
        store: &mut ChunkStore,
        registry: &mut TypeRegistry,
        config: &CodecConfig,
    ) -> CodecResult<()> {
        if self.flavor != PipeFlavor::Fixed {
            return Err(CodecError::InvalidValue(format!(
                "{} is not fixed-size and cannot be overwritten in place",
                self.schema.name()
            )));
        }
        let (bytes, staged) = self.encode_staged(record, registry, store, config)?;
        let old = match self.owned_chains(store, at) {
            Ok(old) => old,
            Err(e) => return Err(self.abandon(&staged, store, e)),
        };
        let mut io = store.io(at.ptr);
        io.set_position(at.offset);
        if let Err(e) = io.write_bytes(&bytes) {
            return Err(self.abandon(&staged, store, e.into()));
        }
        for head in &old {
            store.free_chain(*head)?;
        }
        debug!(
            schema = self.schema.name(),
            ptr = at.ptr.value(),
            offset = at.offset,
            freed = old.len(),
            "overwrote struct in place"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    fn read_bits(&self, input: &mut Cursor<&[u8]>) -> CodecResult<Vec<FieldBits>> {
        let raw = self.merger.read(&mut *input)?;
        let mut bits = vec![FieldBits::default(); self.fields.len()];
        for (m, v) in self.merger.members().iter().zip(raw) {
            let b = &mut bits[m.field];
            match m.role {
                BitRole::Null => b.null = v != 0,
                BitRole::Width => b.width = NumberSize::from_ordinal(v as u8)?,
                BitRole::ElemWidth => b.elem_width = NumberSize::from_ordinal(v as u8)?,
                BitRole::Universe => b.universe = v,
                BitRole::TypeIdWidth => b.id_width = NumberSize::from_ordinal(v as u8)?,
                BitRole::Value => b.value = v,
            }
        }
        Ok(bits)
    }

    /// Step over the zero fill of a null field.
    fn skip_null(&self, input: &mut Cursor<&[u8]>, field: &CompiledField) -> CodecResult<()> {
        match self.flavor {
            PipeFlavor::Fixed => skip(input, field.codec.fixed_size().unwrap_or(0)),
            PipeFlavor::Contiguous => Ok(()),
        }
    }

    /// Decode one record starting at the cursor.
    pub fn decode(&self, input: &mut Cursor<&[u8]>, ctx: &ReadCtx<'_>) -> CodecResult<Record> {
        let bits = self.read_bits(input)?;
        let mut values = Vec::with_capacity(self.fields.len());
        for (field, b) in self.fields.iter().zip(&bits) {
            if b.null {
                self.skip_null(input, field)?;
                values.push(None);
            } else {
                values.push(Some(field.codec.read(input, b, ctx)?));
            }
        }
        Ok(Record::from_values(self.schema.clone(), values))
    }

    /// Decode the record at the cursor of `io` and advance past it.
    pub fn read(
        &self,
        io: &mut ChainIo<'_>,
        registry: &TypeRegistry,
        catalog: &PipeCatalog,
        config: &CodecConfig,
    ) -> CodecResult<Record> {
        let head = io.head();
        let pos = io.position();
        let store: &ChunkStore = io.store();
        let bytes = store.read_chain(head)?;
        let mut input = Cursor::new(bytes.as_slice());
        input.set_position(pos);
        let ctx = ReadCtx {
            store,
            registry,
            catalog,
            config,
        };
        let record = self.decode(&mut input, &ctx)?;
        let end = input.position();
        io.set_position(end);
        Ok(record)
    }

    /// Decode the record stored at `at`.
    pub fn read_at(&self, at: Reference, ctx: &ReadCtx<'_>) -> CodecResult<Record> {
        let bytes = ctx.store.read_chain(at.ptr)?;
        let mut input = Cursor::new(bytes.as_slice());
        input.set_position(at.offset);
        self.decode(&mut input, ctx)
    }

    /// Step over one record without materializing it.
    pub fn skip(&self, input: &mut Cursor<&[u8]>) -> CodecResult<()> {
        let bits = self.read_bits(input)?;
        for (field, b) in self.fields.iter().zip(&bits) {
            if b.null {
                self.skip_null(input, field)?;
            } else {
                field.codec.skip(input, b)?;
            }
        }
        Ok(())
    }

    /// Read a single field, skipping the ones stored before it.
    pub fn read_field(&self, input: &mut Cursor<&[u8]>, name: &str, ctx: &ReadCtx<'_>) -> CodecResult<Option<Value>> {
        let index = self.schema.index_of(name).ok_or_else(|| CodecError::UnknownField {
            schema: self.schema.name().to_string(),
            field: name.to_string(),
        })?;
        let bits = self.read_bits(input)?;
        for (field, b) in self.fields.iter().zip(&bits).take(index) {
            if b.null {
                self.skip_null(input, field)?;
            } else {
                field.codec.skip(input, b)?;
            }
        }
        let (field, b) = (&self.fields[index], &bits[index]);
        if b.null {
            self.skip_null(input, field)?;
            return Ok(None);
        }
        Ok(Some(field.codec.read(input, b, ctx)?))
    }

    // -----------------------------------------------------------------------
    // Out-of-line data
    // -----------------------------------------------------------------------

    /// Step over one record, collecting the heads of every chain it owns,
    /// nested owners before the chains that hold them.
    pub fn collect_refs(&self, input: &mut Cursor<&[u8]>, store: &ChunkStore, out: &mut Vec<ChunkPointer>) -> CodecResult<()> {
        let bits = self.read_bits(input)?;
        for (field, b) in self.fields.iter().zip(&bits) {
            if b.null {
                self.skip_null(input, field)?;
            } else {
                field.codec.collect_refs(input, b, store, out)?;
            }
        }
        Ok(())
    }

    /// Heads of every chain owned by the record stored at `at`.
    pub fn owned_chains(&self, store: &ChunkStore, at: Reference) -> CodecResult<Vec<ChunkPointer>> {
        let bytes = store.read_chain(at.ptr)?;
        let mut input = Cursor::new(bytes.as_slice());
        input.set_position(at.offset);
        let mut owned = Vec::new();
        self.collect_refs(&mut input, store, &mut owned)?;
        Ok(owned)
    }

    /// Free every chain owned by the record stored at `at`, recursively.
    /// The record's own bytes are left alone. Returns the number of chains
    /// freed.
    pub fn free_out_of_line(&self, store: &mut ChunkStore, at: Reference) -> CodecResult<usize> {
        let owned = self.owned_chains(store, at)?;
        for head in &owned {
            store.free_chain(*head)?;
        }
        if !owned.is_empty() {
            debug!(schema = self.schema.name(), chains = owned.len(), "freed out-of-line data");
        }
        Ok(owned.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EnumDef, FieldType};
    use chunkdb_registry::{RegistryError, TypeKey};
    use chunkdb_store::AllocateTicket;
    use proptest::prelude::*;

    struct Env {
        store: ChunkStore,
        registry: TypeRegistry,
        catalog: PipeCatalog,
        config: CodecConfig,
    }

    impl Env {
        fn new() -> Self {
            Self {
                store: ChunkStore::in_memory().unwrap(),
                registry: TypeRegistry::new(),
                catalog: PipeCatalog::new(),
                config: CodecConfig::default(),
            }
        }

        fn pipe(&mut self, schema: Arc<Schema>) -> Arc<StructPipe> {
            self.catalog.register(schema).unwrap()
        }

        fn fixed(&mut self, schema: Arc<Schema>) -> Arc<StructPipe> {
            self.catalog.register_fixed(schema).unwrap()
        }

        fn encode(&mut self, pipe: &StructPipe, record: &Record) -> Vec<u8> {
            let bytes = pipe
                .encode(record, &mut self.registry, &mut self.store, &self.config)
                .unwrap();
            assert_eq!(bytes.len() as u64, pipe.size_of(record, &self.registry));
            bytes
        }

        fn ctx(&self) -> ReadCtx<'_> {
            ReadCtx {
                store: &self.store,
                registry: &self.registry,
                catalog: &self.catalog,
                config: &self.config,
            }
        }

        fn round_trip(&mut self, pipe: &StructPipe, record: &Record) -> Vec<u8> {
            let bytes = self.encode(pipe, record);
            let mut input = Cursor::new(bytes.as_slice());
            let back = pipe.decode(&mut input, &self.ctx()).unwrap();
            assert_eq!(input.position(), bytes.len() as u64);
            assert_eq!(&back, record);

            let mut input = Cursor::new(bytes.as_slice());
            pipe.skip(&mut input).unwrap();
            assert_eq!(input.position(), bytes.len() as u64);
            bytes
        }
    }

    fn color() -> Arc<EnumDef> {
        EnumDef::new("Color", ["Red", "Green", "Blue"])
    }

    fn point() -> Arc<Schema> {
        Schema::builder("Point")
            .field("x", FieldType::I32)
            .field("y", FieldType::I32)
            .build()
    }

    fn shape() -> Arc<Schema> {
        Schema::builder("Shape")
            .field("visible", FieldType::Bool)
            .field("color", FieldType::Enum(color()))
            .nullable("name", FieldType::Str)
            .field("weight", FieldType::VarInt)
            .field("origin", FieldType::Struct(point()))
            .field("path", FieldType::list(FieldType::Struct(point())))
            .field("flags", FieldType::fixed_array(FieldType::Bool, 10))
            .field("samples", FieldType::list(FieldType::VarUInt))
            .default_if_null("tags", FieldType::list(FieldType::Str))
            .nullable("blob", FieldType::Bytes)
            .build()
    }

    fn pt(x: i64, y: i64) -> Value {
        Value::Record(Record::new(point()).with("x", x).unwrap().with("y", y).unwrap())
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    #[test]
    fn three_bools_and_a_32_variant_enum_share_one_byte() {
        let big = EnumDef::new("Big", (0..32).map(|i| format!("V{i}")));
        let s = Schema::builder("Flags")
            .field("a", FieldType::Bool)
            .field("b", FieldType::Bool)
            .field("c", FieldType::Bool)
            .field("e", FieldType::Enum(big.clone()))
            .build();
        let pipe = StructPipe::compile(&s, PipeFlavor::Contiguous).unwrap();
        assert_eq!(pipe.merger().total_bits(), 8);
        assert_eq!(pipe.merger().safety_bits(), 0);
        assert_eq!(pipe.fixed_size(), Some(1));

        let mut env = Env::new();
        let r = Record::new(s)
            .with("a", true)
            .unwrap()
            .with("c", true)
            .unwrap()
            .with("e", big.value("V31").unwrap())
            .unwrap();
        let bytes = env.round_trip(&pipe, &r);
        assert_eq!(bytes, vec![0b1111_1101]);
    }

    #[test]
    fn fixed_size_struct_has_fixed_descriptor() {
        let pipe = StructPipe::compile(&point(), PipeFlavor::Contiguous).unwrap();
        assert_eq!(pipe.fixed_size(), Some(8));
        let line = Schema::builder("Line")
            .field("from", FieldType::Struct(point()))
            .field("to", FieldType::StructRef(point()))
            .build();
        let pipe = StructPipe::compile(&line, PipeFlavor::Contiguous).unwrap();
        assert_eq!(pipe.fixed_size(), Some(8 + 16));
    }

    #[test]
    fn var_int_width_follows_value() {
        let s = Schema::builder("V").field("v", FieldType::VarInt).build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        for (value, len) in [(0i64, 1usize), (-1, 2), (127, 2), (128, 3), (i64::MIN, 9)] {
            let r = Record::new(s.clone()).with("v", value).unwrap();
            assert_eq!(env.round_trip(&pipe, &r).len(), len, "value {value}");
        }
    }

    #[test]
    fn bool_list_is_bit_packed() {
        let s = Schema::builder("Bits").field("bits", FieldType::list(FieldType::Bool)).build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        let r = Record::new(s).with("bits", Value::List(vec![Value::Bool(true); 9])).unwrap();
        // group byte, one count byte, two bytes of packed bits
        assert_eq!(env.round_trip(&pipe, &r).len(), 4);
    }

    // -----------------------------------------------------------------------
    // Round trips
    // -----------------------------------------------------------------------

    #[test]
    fn every_shape_round_trips() {
        let mut env = Env::new();
        let pipe = env.pipe(shape());
        let mut r = Record::new(shape());
        env.round_trip(&pipe, &r);

        r.set("visible", true).unwrap();
        r.set("color", color().value("Blue").unwrap()).unwrap();
        r.set("name", "triangle").unwrap();
        r.set("weight", -70_000i64).unwrap();
        r.set("origin", pt(1, -1)).unwrap();
        r.set("path", Value::List(vec![pt(0, 0), pt(3, 4), pt(-5, 12)])).unwrap();
        r.set(
            "flags",
            Value::List((0..10).map(|i| Value::Bool(i % 3 == 0)).collect()),
        )
        .unwrap();
        r.set("samples", Value::List(vec![Value::UInt(1), Value::UInt(300), Value::UInt(0)]))
            .unwrap();
        r.set("tags", Value::List(vec!["a".into(), "".into(), "ccc".into()])).unwrap();
        r.set("blob", vec![9u8; 300]).unwrap();
        env.round_trip(&pipe, &r);
    }

    #[test]
    fn scalars_round_trip_at_their_limits() {
        let s = Schema::builder("Limits")
            .field("a", FieldType::I8)
            .field("b", FieldType::I16)
            .field("c", FieldType::U32)
            .field("d", FieldType::U64)
            .field("e", FieldType::F32)
            .field("f", FieldType::F64)
            .field("g", FieldType::Char)
            .field("h", FieldType::fixed_array(FieldType::I16, 3))
            .build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        assert_eq!(pipe.fixed_size(), Some(1 + 2 + 4 + 8 + 4 + 8 + 4 + 6));
        let r = Record::new(s)
            .with("a", i64::from(i8::MIN))
            .unwrap()
            .with("b", i64::from(i16::MAX))
            .unwrap()
            .with("c", u64::from(u32::MAX))
            .unwrap()
            .with("d", u64::MAX)
            .unwrap()
            .with("e", 1.5f64)
            .unwrap()
            .with("f", -0.1f64)
            .unwrap()
            .with("g", '€')
            .unwrap()
            .with("h", Value::List(vec![Value::Int(-1), Value::Int(0), Value::Int(1)]))
            .unwrap();
        env.round_trip(&pipe, &r);
    }

    #[test]
    fn f32_fields_only_take_exactly_representable_floats() {
        let s = Schema::builder("Reading").field("v", FieldType::F32).build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());

        let err = Record::new(s.clone()).with("v", 0.1f64).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { ref field, .. } if field == "v"));

        let r = Record::new(s).with("v", 0.1f32).unwrap();
        env.round_trip(&pipe, &r);
        assert_eq!(r.get("v"), Some(&Value::Float(f64::from(0.1f32))));
    }

    #[test]
    fn struct_references_live_in_their_own_chain() {
        let s = Schema::builder("Edge")
            .field("from", FieldType::StructRef(point()))
            .nullable("to", FieldType::StructRef(point()))
            .build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        let before = env.store.chain_heads().unwrap().len();

        let r = Record::new(s.clone()).with("from", pt(7, 8)).unwrap();
        env.round_trip(&pipe, &r);
        assert_eq!(env.store.chain_heads().unwrap().len(), before + 1);

        let r = r.with("to", pt(9, 10)).unwrap();
        env.round_trip(&pipe, &r);
        assert_eq!(env.store.chain_heads().unwrap().len(), before + 3);
    }

    #[test]
    fn dynamic_fields_round_trip() {
        let s = Schema::builder("Bag")
            .field("inline", FieldType::Dynamic)
            .nullable("boxed", FieldType::DynamicRef)
            .field("many", FieldType::list(FieldType::Dynamic))
            .build();
        let mut env = Env::new();
        env.pipe(point());
        let pipe = env.pipe(s.clone());

        let r = Record::new(s)
            .with("inline", pt(1, 2))
            .unwrap()
            .with("boxed", Value::List(vec![Value::Str("x".into()), Value::Float(2.0)]))
            .unwrap()
            .with("many", Value::List(vec![Value::Bool(true), Value::Char('z'), pt(3, 4)]))
            .unwrap();
        env.round_trip(&pipe, &r);
        assert!(env.registry.lookup(&TypeKey::struct_named("Point")).is_some());
    }

    #[test]
    fn sealed_variants_select_their_pipe() {
        let circle = Schema::builder("Circle").field("r", FieldType::U16).build();
        let rect = Schema::builder("Rect")
            .field("w", FieldType::U16)
            .field("h", FieldType::U16)
            .build();
        let s = Schema::builder("Figure")
            .field("shape", FieldType::Sealed(vec![circle.clone(), rect.clone()]))
            .build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        assert_eq!(pipe.merger().total_bits(), 1);

        let c = Record::new(circle).with("r", 5u64).unwrap();
        assert_eq!(env.round_trip(&pipe, &Record::new(s.clone()).with("shape", c).unwrap()).len(), 3);
        let q = Record::new(rect).with("w", 2u64).unwrap().with("h", 3u64).unwrap();
        assert_eq!(env.round_trip(&pipe, &Record::new(s.clone()).with("shape", q).unwrap()).len(), 5);

        let fixed = env.fixed(s.clone());
        assert_eq!(fixed.fixed_size(), Some(1 + 4));
        let c = Record::new(Schema::builder("Circle").field("r", FieldType::U16).build())
            .with("r", 1u64)
            .unwrap();
        env.round_trip(&fixed, &Record::new(s).with("shape", c).unwrap());
    }

    proptest! {
        #[test]
        fn strings_and_ints_round_trip(
            name in proptest::option::of(".{0,40}"),
            weight in any::<i64>(),
            samples in proptest::collection::vec(any::<u64>(), 0..20),
            blob in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..300)),
        ) {
            let mut env = Env::new();
            let pipe = env.pipe(shape());
            let mut r = Record::new(shape());
            r.set_opt("name", name.map(Value::Str)).unwrap();
            r.set("weight", weight).unwrap();
            r.set("samples", Value::List(samples.into_iter().map(Value::UInt).collect())).unwrap();
            r.set_opt("blob", blob.map(Value::Bytes)).unwrap();
            env.round_trip(&pipe, &r);
        }
    }

    // -----------------------------------------------------------------------
    // Nullability and generated values
    // -----------------------------------------------------------------------

    #[test]
    fn null_payloads_are_absent_in_contiguous_and_zeroed_in_fixed() {
        let s = Schema::builder("Opt")
            .nullable("a", FieldType::U32)
            .field("b", FieldType::U8)
            .build();
        let mut env = Env::new();
        let contiguous = env.pipe(s.clone());
        let fixed = env.fixed(s.clone());
        let r = Record::new(s).with("b", 7u64).unwrap();
        assert_eq!(env.round_trip(&contiguous, &r), vec![0b1, 7]);
        assert_eq!(env.round_trip(&fixed, &r), vec![0b1, 0, 0, 0, 0, 7]);
        assert_eq!(fixed.fixed_size(), Some(6));
        assert_eq!(contiguous.fixed_size(), None);
    }

    #[test]
    fn unstaged_reference_fails_fast() {
        let s = Schema::builder("Edge").field("to", FieldType::StructRef(point())).build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        let r = Record::new(s).with("to", pt(1, 1)).unwrap();
        let mut out = Vec::new();
        let err = pipe
            .write_staged(&r, &Staged::empty(), &env.registry, &env.config, &mut out)
            .unwrap_err();
        assert!(matches!(err, CodecError::ReferenceNotAllocated { ref field } if field == "to"));
    }

    #[test]
    fn unstaged_width_is_reported() {
        let s = Schema::builder("S").field("name", FieldType::Str).build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        let r = Record::new(s).with("name", "x").unwrap();
        let err = pipe
            .write_staged(&r, &Staged::empty(), &env.registry, &env.config, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, CodecError::MissingGenerated { what: "width", .. }));
    }

    #[test]
    fn size_mismatch_is_caught_when_validating() {
        let s = Schema::builder("S").field("name", FieldType::Str).build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        let r = Record::new(s).with("name", "hello").unwrap();
        let mut staged = pipe.stage(&r, &mut env.registry, &mut env.store, &env.config).unwrap();
        staged.slots[0].width = Some(NumberSize::Short);

        let mut out = Vec::new();
        let err = pipe
            .write_staged(&r, &staged, &env.registry, &env.config, &mut out)
            .unwrap_err();
        assert!(matches!(err, CodecError::SizeMismatch { expected: 6, actual: 7, .. }));

        let lax = CodecConfig {
            validate: false,
            ..CodecConfig::default()
        };
        pipe.write_staged(&r, &staged, &env.registry, &lax, &mut Vec::new())
            .unwrap();
    }

    #[test]
    fn wrong_schema_is_rejected() {
        let mut env = Env::new();
        let pipe = env.pipe(point());
        let other = Record::new(Schema::builder("Other").field("x", FieldType::I32).build());
        assert!(matches!(
            pipe.encode(&other, &mut env.registry, &mut env.store, &env.config),
            Err(CodecError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn fixed_flavor_rejects_variable_fields() {
        let s = Schema::builder("S").field("name", FieldType::Str).build();
        assert!(matches!(
            StructPipe::compile(&s, PipeFlavor::Fixed),
            Err(CodecError::UnsupportedField { .. })
        ));
        let nested = Schema::builder("Outer").field("inner", FieldType::Struct(s)).build();
        assert!(StructPipe::compile(&nested, PipeFlavor::Fixed).is_err());
    }

    // -----------------------------------------------------------------------
    // Chains, partial reads, in-place writes
    // -----------------------------------------------------------------------

    #[test]
    fn write_and_read_through_chain_io() {
        let mut env = Env::new();
        let pipe = env.pipe(shape());
        let head = env.store.allocate(AllocateTicket::bytes(4)).unwrap().ptr;
        let a = Record::new(shape()).with("name", "first").unwrap();
        let b = Record::new(shape()).with("weight", 99i64).unwrap();

        {
            let mut io = env.store.io(head);
            pipe.write(&a, &mut io, &mut env.registry, &env.config).unwrap();
            pipe.write(&b, &mut io, &mut env.registry, &env.config).unwrap();
        }
        let mut io = env.store.io(head);
        let back_a = pipe.read(&mut io, &env.registry, &env.catalog, &env.config).unwrap();
        let back_b = pipe.read(&mut io, &env.registry, &env.catalog, &env.config).unwrap();
        assert_eq!(back_a, a);
        assert_eq!(back_b, b);
        assert_eq!(io.position(), io.size().unwrap());
    }

    #[test]
    fn read_field_skips_the_rest() {
        let mut env = Env::new();
        let pipe = env.pipe(shape());
        let r = Record::new(shape())
            .with("name", "n")
            .unwrap()
            .with("path", Value::List(vec![pt(1, 2)]))
            .unwrap()
            .with("tags", Value::List(vec!["t".into()]))
            .unwrap();
        let bytes = env.encode(&pipe, &r);
        let ctx = env.ctx();
        let field = |name: &str| pipe.read_field(&mut Cursor::new(bytes.as_slice()), name, &ctx).unwrap();
        assert_eq!(field("tags"), Some(Value::List(vec!["t".into()])));
        assert_eq!(field("name"), Some(Value::Str("n".into())));
        assert_eq!(field("blob"), None);
        assert!(pipe
            .read_field(&mut Cursor::new(bytes.as_slice()), "nope", &ctx)
            .is_err());
    }

    #[test]
    fn in_place_overwrite_replaces_out_of_line_data() {
        let s = Schema::builder("Node")
            .field("id", FieldType::U32)
            .field("child", FieldType::StructRef(point()))
            .build();
        let mut env = Env::new();
        let pipe = env.fixed(s.clone());
        let r = Record::new(s.clone()).with("id", 1u64).unwrap().with("child", pt(1, 1)).unwrap();
        let bytes = env.encode(&pipe, &r);
        let head = env.store.allocate(AllocateTicket::with_data(bytes)).unwrap().ptr;
        let heads = env.store.chain_heads().unwrap().len();

        let updated = r.with("id", 2u64).unwrap().with("child", pt(5, 6)).unwrap();
        pipe.write_in_place(&updated, head.at(0), &mut env.store, &mut env.registry, &env.config)
            .unwrap();
        assert_eq!(env.store.chain_heads().unwrap().len(), heads);
        assert_eq!(pipe.read_at(head.at(0), &env.ctx()).unwrap(), updated);
        env.store.verify().unwrap();

        let contiguous = env.pipe(s.clone());
        assert!(contiguous
            .write_in_place(&updated, head.at(0), &mut env.store, &mut env.registry, &env.config)
            .is_err());
    }

    #[test]
    fn failed_in_place_overwrite_keeps_old_record_and_chains() {
        let tagged = Schema::builder("Tagged").field("tag", FieldType::Dynamic).build();
        let s = Schema::builder("Node")
            .field("child", FieldType::StructRef(point()))
            .field("label", FieldType::StructRef(tagged.clone()))
            .build();
        let mut env = Env::new();
        let pipe = env.fixed(s.clone());
        let r = Record::new(s.clone())
            .with("child", pt(1, 1))
            .unwrap()
            .with("label", Record::new(tagged.clone()).with("tag", "first").unwrap())
            .unwrap();
        let bytes = env.encode(&pipe, &r);
        let head = env.store.allocate(AllocateTicket::with_data(bytes)).unwrap().ptr;
        let heads = env.store.chain_heads().unwrap();

        env.config.allow_register = false;
        let updated = r
            .clone()
            .with("child", pt(5, 6))
            .unwrap()
            .with("label", Record::new(tagged).with("tag", ghost()).unwrap())
            .unwrap();
        let err = pipe
            .write_in_place(&updated, head.at(0), &mut env.store, &mut env.registry, &env.config)
            .unwrap_err();
        assert!(matches!(err, CodecError::Registry(RegistryError::UnknownType(_))));
        assert_eq!(env.store.chain_heads().unwrap(), heads);
        assert_eq!(pipe.read_at(head.at(0), &env.ctx()).unwrap(), r);
        env.store.verify().unwrap();
    }

    // -----------------------------------------------------------------------
    // Failed staging
    // -----------------------------------------------------------------------

    fn ghost() -> Value {
        Value::Enum {
            name: "Ghost".into(),
            ordinal: 0,
        }
    }

    #[test]
    fn failed_stage_frees_chains_allocated_for_earlier_fields() {
        let s = Schema::builder("Parcel")
            .field("boxed", FieldType::DynamicRef)
            .field("inline", FieldType::Dynamic)
            .build();
        let mut env = Env::new();
        env.config.allow_register = false;
        let pipe = env.pipe(s.clone());
        let before = env.store.chain_heads().unwrap();

        let r = Record::new(s)
            .with("boxed", "out of line")
            .unwrap()
            .with("inline", ghost())
            .unwrap();
        let err = pipe
            .encode(&r, &mut env.registry, &mut env.store, &env.config)
            .unwrap_err();
        assert!(matches!(err, CodecError::Registry(RegistryError::UnknownType(_))));
        assert_eq!(env.store.chain_heads().unwrap(), before);
        env.store.verify().unwrap();
    }

    #[test]
    fn failed_list_element_releases_earlier_elements() {
        let item = Schema::builder("Item")
            .field("at", FieldType::StructRef(point()))
            .field("tag", FieldType::Dynamic)
            .build();
        let s = Schema::builder("Batch")
            .field("items", FieldType::list(FieldType::Struct(item.clone())))
            .build();
        let mut env = Env::new();
        env.config.allow_register = false;
        let pipe = env.pipe(s.clone());
        let before = env.store.chain_heads().unwrap();

        let good = Record::new(item.clone()).with("at", pt(1, 2)).unwrap().with("tag", 5i64).unwrap();
        let bad = Record::new(item).with("at", pt(3, 4)).unwrap().with("tag", ghost()).unwrap();
        let r = Record::new(s)
            .with("items", Value::List(vec![good.into(), bad.into()]))
            .unwrap();
        assert!(pipe.stage(&r, &mut env.registry, &mut env.store, &env.config).is_err());
        assert_eq!(env.store.chain_heads().unwrap(), before);
        env.store.verify().unwrap();
    }

    #[test]
    fn release_undoes_a_stage_that_is_never_written() {
        let s = Schema::builder("Edge")
            .field("from", FieldType::StructRef(point()))
            .field("note", FieldType::DynamicRef)
            .build();
        let mut env = Env::new();
        let pipe = env.pipe(s.clone());
        let before = env.store.chain_heads().unwrap();

        let r = Record::new(s).with("from", pt(0, 9)).unwrap().with("note", 3u64).unwrap();
        let staged = pipe.stage(&r, &mut env.registry, &mut env.store, &env.config).unwrap();
        assert_eq!(env.store.chain_heads().unwrap().len(), before.len() + 2);
        assert_eq!(pipe.release(&staged, &mut env.store).unwrap(), 2);
        assert_eq!(env.store.chain_heads().unwrap(), before);
    }

    #[test]
    fn free_out_of_line_walks_nested_references() {
        let leaf = Schema::builder("Leaf").field("v", FieldType::Str).build();
        let mid = Schema::builder("Mid")
            .field("leaf", FieldType::StructRef(leaf.clone()))
            .field("extra", FieldType::DynamicRef)
            .build();
        let top = Schema::builder("Top")
            .field("mid", FieldType::StructRef(mid.clone()))
            .field("inline", FieldType::list(FieldType::Struct(mid.clone())))
            .build();
        let mut env = Env::new();
        let pipe = env.pipe(top.clone());
        let base = env.store.chain_heads().unwrap().len();

        let make_mid = |v: &str| {
            Value::Record(
                Record::new(mid.clone())
                    .with("leaf", Record::new(leaf.clone()).with("v", v).unwrap())
                    .unwrap()
                    .with("extra", Value::Bytes(vec![1, 2, 3]))
                    .unwrap(),
            )
        };
        let r = Record::new(top)
            .with("mid", make_mid("a"))
            .unwrap()
            .with("inline", Value::List(vec![make_mid("b")]))
            .unwrap();
        let bytes = env.encode(&pipe, &r);
        let head = env.store.allocate(AllocateTicket::with_data(bytes)).unwrap().ptr;
        // mid, its leaf and extra, the inline mid's leaf and extra, the record
        assert_eq!(env.store.chain_heads().unwrap().len(), base + 6);

        assert_eq!(pipe.free_out_of_line(&mut env.store, head.at(0)).unwrap(), 5);
        assert_eq!(env.store.chain_heads().unwrap().len(), base + 1);
        env.store.verify().unwrap();
    }
}
