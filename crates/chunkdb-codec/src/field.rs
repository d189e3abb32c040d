//! Field codecs: one closed enum, dispatched by pattern match.
//!
//! Every codec splits its output in two. Bit-sized parts (bool values, enum
//! ordinals, width flags, sealed universe ids) go to the struct's bit group;
//! the rest is written in field order after the group. For one field the
//! byte part is its generated values (length, type id, reference) followed
//! by its payload.

use std::io::Cursor;
use std::sync::Arc;

use chunkdb_registry::TypeRegistry;
use chunkdb_store::{AllocateTicket, ChunkStore};
use chunkdb_types::{bits_for_universe, bytes_for_bits, BitReader, BitWriter, ChunkPointer, NumberSize, Reference, TypeError};
use tracing::warn;

use crate::catalog::PipeCatalog;
use crate::config::CodecConfig;
use crate::cursor::{read_array, read_u8, read_vec, skip, Input};
use crate::dynamic;
use crate::error::{CodecError, CodecResult};
use crate::merger::BitRole;
use crate::pipe::{PipeFlavor, ReadCtx, Staged, StructPipe};
use crate::schema::{fits_f32, EnumDef, FieldDef, FieldType};
use crate::value::Value;

fn mismatch(field: &str, expected: &str, value: &Value) -> CodecError {
    CodecError::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: value.kind_name().to_string(),
    }
}

fn missing(field: &str, what: &'static str) -> CodecError {
    CodecError::MissingGenerated {
        field: field.to_string(),
        what,
    }
}

fn unsupported(schema: &str, field: &str, reason: impl Into<String>) -> CodecError {
    CodecError::UnsupportedField {
        schema: schema.to_string(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn read_string(input: &mut Input<'_>, len: u64) -> CodecResult<String> {
    String::from_utf8(read_vec(input, len)?).map_err(|e| CodecError::InvalidValue(e.to_string()))
}

fn read_reference(input: &mut Input<'_>) -> CodecResult<Reference> {
    let r = Reference::from_bytes(&read_array::<{ Reference::ENCODED_LEN }>(input)?);
    if r.is_null() {
        return Err(CodecError::InvalidValue("null reference in a present field".into()));
    }
    Ok(r)
}

/// All bytes of the chain a reference points into.
fn referenced(store: &ChunkStore, r: Reference) -> CodecResult<Vec<u8>> {
    Ok(store.read_chain(r.ptr)?)
}

/// Generated values of one field, computed before anything is written.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Slot {
    /// NumberSize of a variable-width value, or of a length or count.
    pub width: Option<NumberSize>,
    pub length: Option<u64>,
    pub elem_width: Option<NumberSize>,
    pub universe: Option<u64>,
    pub type_id: Option<u32>,
    pub reference: Option<Reference>,
    /// Staged values of nested inline structs, one per struct.
    pub nested: Vec<Staged>,
}

/// Bit-group values of one field as read back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FieldBits {
    pub null: bool,
    pub width: NumberSize,
    pub elem_width: NumberSize,
    pub universe: u64,
    pub id_width: NumberSize,
    pub value: u64,
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

/// Fixed-width numeric or char codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Unicode scalar value as `u32`.
    Char,
}

impl Scalar {
    fn of(ty: &FieldType) -> Option<Self> {
        Some(match ty {
            FieldType::I8 => Self::I8,
            FieldType::I16 => Self::I16,
            FieldType::I32 => Self::I32,
            FieldType::I64 => Self::I64,
            FieldType::U8 => Self::U8,
            FieldType::U16 => Self::U16,
            FieldType::U32 => Self::U32,
            FieldType::U64 => Self::U64,
            FieldType::F32 => Self::F32,
            FieldType::F64 => Self::F64,
            FieldType::Char => Self::Char,
            _ => return None,
        })
    }

    pub fn width(self) -> u64 {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 | Self::Char => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Char => "char",
        }
    }

    fn write(self, field: &str, value: &Value, out: &mut Vec<u8>) -> CodecResult<()> {
        let bad = || mismatch(field, self.name(), value);
        match (self, value) {
            (Self::I8, Value::Int(v)) => out.extend(i8::try_from(*v).map_err(|_| bad())?.to_le_bytes()),
            (Self::I16, Value::Int(v)) => out.extend(i16::try_from(*v).map_err(|_| bad())?.to_le_bytes()),
            (Self::I32, Value::Int(v)) => out.extend(i32::try_from(*v).map_err(|_| bad())?.to_le_bytes()),
            (Self::I64, Value::Int(v)) => out.extend(v.to_le_bytes()),
            (Self::U8, Value::UInt(v)) => out.extend(u8::try_from(*v).map_err(|_| bad())?.to_le_bytes()),
            (Self::U16, Value::UInt(v)) => out.extend(u16::try_from(*v).map_err(|_| bad())?.to_le_bytes()),
            (Self::U32, Value::UInt(v)) => out.extend(u32::try_from(*v).map_err(|_| bad())?.to_le_bytes()),
            (Self::U64, Value::UInt(v)) => out.extend(v.to_le_bytes()),
            (Self::F32, Value::Float(v)) if fits_f32(*v) => out.extend((*v as f32).to_le_bytes()),
            (Self::F64, Value::Float(v)) => out.extend(v.to_le_bytes()),
            (Self::Char, Value::Char(c)) => out.extend(u32::from(*c).to_le_bytes()),
            _ => return Err(bad()),
        }
        Ok(())
    }

    fn read(self, input: &mut Input<'_>) -> CodecResult<Value> {
        Ok(match self {
            Self::I8 => Value::Int(i8::from_le_bytes(read_array(input)?).into()),
            Self::I16 => Value::Int(i16::from_le_bytes(read_array(input)?).into()),
            Self::I32 => Value::Int(i32::from_le_bytes(read_array(input)?).into()),
            Self::I64 => Value::Int(i64::from_le_bytes(read_array(input)?)),
            Self::U8 => Value::UInt(u8::from_le_bytes(read_array(input)?).into()),
            Self::U16 => Value::UInt(u16::from_le_bytes(read_array(input)?).into()),
            Self::U32 => Value::UInt(u32::from_le_bytes(read_array(input)?).into()),
            Self::U64 => Value::UInt(u64::from_le_bytes(read_array(input)?)),
            Self::F32 => Value::Float(f32::from_le_bytes(read_array(input)?).into()),
            Self::F64 => Value::Float(f64::from_le_bytes(read_array(input)?)),
            Self::Char => {
                let raw = u32::from_le_bytes(read_array(input)?);
                Value::Char(
                    char::from_u32(raw)
                        .ok_or_else(|| CodecError::InvalidValue(format!("invalid char {raw:#x}")))?,
                )
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Array elements
// ---------------------------------------------------------------------------

/// Codec for the elements of a fixed array or list.
#[derive(Clone, Debug)]
pub enum ElemCodec {
    /// Bit-packed, `ceil(n / 8)` bytes.
    Bool,
    /// Ordinals bit-packed at the enum's width.
    Enum(Arc<EnumDef>),
    Scalar(Scalar),
    /// All elements at one shared width taken from the largest magnitude.
    Var { signed: bool },
    /// Each element: width byte, length, UTF-8 bytes.
    Text,
    /// Each element: width byte, length, bytes.
    Blob,
    Struct(Arc<StructPipe>),
    /// Each element a full self-describing dynamic value.
    Dynamic,
}

impl ElemCodec {
    fn compile(
        schema: &str,
        field: &str,
        elem: &FieldType,
        flavor: PipeFlavor,
        catalog: &mut PipeCatalog,
    ) -> CodecResult<Self> {
        if let Some(s) = Scalar::of(elem) {
            return Ok(Self::Scalar(s));
        }
        Ok(match elem {
            FieldType::Bool => Self::Bool,
            FieldType::Enum(def) if !def.is_empty() => Self::Enum(def.clone()),
            FieldType::VarInt => Self::Var { signed: true },
            FieldType::VarUInt => Self::Var { signed: false },
            FieldType::Str => Self::Text,
            FieldType::Bytes => Self::Blob,
            FieldType::Struct(s) => Self::Struct(catalog.compile(s, flavor)?),
            FieldType::Dynamic => Self::Dynamic,
            other => return Err(unsupported(schema, field, format!("{other} is not an array element type"))),
        })
    }

    fn var_width(items: &[Value], signed: bool) -> NumberSize {
        items
            .iter()
            .map(|v| match (signed, v) {
                (true, Value::Int(i)) => NumberSize::by_size_signed(*i),
                (false, Value::UInt(u)) => NumberSize::by_size(*u),
                _ => NumberSize::Void,
            })
            .max()
            .unwrap_or(NumberSize::Void)
    }

    fn fixed_size(&self, count: u64) -> Option<u64> {
        match self {
            Self::Bool => Some(bytes_for_bits(count)),
            Self::Enum(def) => Some(bytes_for_bits(count * u64::from(def.bits()))),
            Self::Scalar(s) => Some(count * s.width()),
            Self::Struct(p) => p.fixed_size().map(|n| n * count),
            Self::Var { .. } | Self::Text | Self::Blob | Self::Dynamic => None,
        }
    }

    fn size(&self, items: &[Value], registry: &TypeRegistry) -> u64 {
        if let Some(n) = self.fixed_size(items.len() as u64) {
            return n;
        }
        let text = |len: usize| 1 + NumberSize::by_size(len as u64).bytes() as u64 + len as u64;
        match self {
            Self::Var { signed } => items.len() as u64 * Self::var_width(items, *signed).bytes() as u64,
            Self::Text => items.iter().map(|v| v.as_str().map_or(0, |s| text(s.len()))).sum(),
            Self::Blob => items.iter().map(|v| v.as_bytes().map_or(0, |b| text(b.len()))).sum(),
            Self::Struct(p) => items
                .iter()
                .map(|v| v.as_record().map_or(0, |r| p.size_of(r, registry)))
                .sum(),
            Self::Dynamic => items.iter().map(|v| dynamic::value_size(v, registry)).sum(),
            Self::Bool | Self::Enum(_) | Self::Scalar(_) => 0,
        }
    }

    fn stage(
        &self,
        field: &str,
        items: &[Value],
        slot: &mut Slot,
        registry: &mut TypeRegistry,
        store: &mut ChunkStore,
        config: &CodecConfig,
    ) -> CodecResult<()> {
        match self {
            Self::Var { signed } => slot.elem_width = Some(Self::var_width(items, *signed)),
            Self::Struct(p) => {
                for item in items {
                    let staged = item
                        .as_record()
                        .ok_or_else(|| mismatch(field, "struct", item))
                        .and_then(|record| p.stage(record, registry, store, config));
                    match staged {
                        Ok(staged) => slot.nested.push(staged),
                        Err(e) => return Err(abandon_nested(p, &slot.nested, store, e)),
                    }
                }
            }
            Self::Dynamic => {
                for item in items {
                    dynamic::stage(item, registry, config.allow_register)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn write(
        &self,
        field: &str,
        items: &[Value],
        slot: &Slot,
        registry: &TypeRegistry,
        config: &CodecConfig,
        out: &mut Vec<u8>,
    ) -> CodecResult<()> {
        match self {
            Self::Bool => {
                let mut bits = BitWriter::new(&mut *out);
                for item in items {
                    bits.write_bit(item.as_bool().ok_or_else(|| mismatch(field, "bool", item))?)?;
                }
                bits.finish()?;
            }
            Self::Enum(def) => {
                let mut bits = BitWriter::new(&mut *out);
                for item in items {
                    bits.write_value(enum_ordinal(field, def, item)?, def.bits())?;
                }
                bits.finish()?;
            }
            Self::Scalar(s) => {
                for item in items {
                    s.write(field, item, out)?;
                }
            }
            Self::Var { signed } => {
                let width = slot.elem_width.ok_or_else(|| missing(field, "element width"))?;
                for item in items {
                    match (signed, item) {
                        (true, Value::Int(v)) => width.write_signed_to(out, *v)?,
                        (false, Value::UInt(v)) => width.write_to(out, *v)?,
                        _ => return Err(mismatch(field, if *signed { "varint" } else { "varuint" }, item)),
                    }
                }
            }
            Self::Text | Self::Blob => {
                for item in items {
                    let bytes = match (self, item) {
                        (Self::Text, Value::Str(s)) => s.as_bytes(),
                        (Self::Blob, Value::Bytes(b)) => b.as_slice(),
                        _ => return Err(mismatch(field, if matches!(self, Self::Text) { "str" } else { "bytes" }, item)),
                    };
                    let width = NumberSize::by_size(bytes.len() as u64);
                    out.push(width.ordinal());
                    width.write_to(out, bytes.len() as u64)?;
                    out.extend_from_slice(bytes);
                }
            }
            Self::Struct(p) => {
                for (i, item) in items.iter().enumerate() {
                    let record = item.as_record().ok_or_else(|| mismatch(field, "struct", item))?;
                    let staged = slot.nested.get(i).ok_or_else(|| missing(field, "nested struct"))?;
                    p.write_staged(record, staged, registry, config, out)?;
                }
            }
            Self::Dynamic => {
                for item in items {
                    dynamic::write_value(item, registry, out)?;
                }
            }
        }
        Ok(())
    }

    fn read(&self, input: &mut Input<'_>, count: u64, width: NumberSize, ctx: &ReadCtx<'_>) -> CodecResult<Vec<Value>> {
        match self {
            Self::Bool => {
                let mut bits = BitReader::with_bit_count(&mut *input, count)?;
                (0..count)
                    .map(|_| -> CodecResult<Value> { Ok(Value::Bool(bits.read_bit()?)) })
                    .collect()
            }
            Self::Enum(def) => {
                let mut bits = BitReader::with_bit_count(&mut *input, count * u64::from(def.bits()))?;
                (0..count)
                    .map(|_| -> CodecResult<Value> {
                        let ordinal = bits.read_enum(def.len())?;
                        Ok(Value::Enum {
                            name: def.name().to_string(),
                            ordinal: ordinal as u32,
                        })
                    })
                    .collect()
            }
            Self::Scalar(s) => (0..count).map(|_| s.read(input)).collect(),
            Self::Var { signed } => (0..count)
                .map(|_| -> CodecResult<Value> {
                    Ok(if *signed {
                        Value::Int(width.read_signed_from(input)?)
                    } else {
                        Value::UInt(width.read_from(input)?)
                    })
                })
                .collect(),
            Self::Text | Self::Blob => (0..count)
                .map(|_| -> CodecResult<Value> {
                    let w = NumberSize::from_ordinal(read_u8(input)?)?;
                    let len = w.read_from(input)?;
                    Ok(match self {
                        Self::Text => Value::Str(read_string(input, len)?),
                        _ => Value::Bytes(read_vec(input, len)?),
                    })
                })
                .collect(),
            Self::Struct(p) => (0..count)
                .map(|_| -> CodecResult<Value> { Ok(Value::Record(p.decode(input, ctx)?)) })
                .collect(),
            Self::Dynamic => (0..count).map(|_| dynamic::read_value(input, ctx)).collect(),
        }
    }

    fn skip(&self, input: &mut Input<'_>, count: u64, width: NumberSize) -> CodecResult<()> {
        if let Some(n) = self.fixed_size(count) {
            return skip(input, n);
        }
        match self {
            Self::Var { .. } => skip(input, count * width.bytes() as u64),
            Self::Text | Self::Blob => (0..count).try_for_each(|_| -> CodecResult<()> {
                let w = NumberSize::from_ordinal(read_u8(input)?)?;
                let len = w.read_from(input)?;
                skip(input, len)
            }),
            Self::Struct(p) => (0..count).try_for_each(|_| p.skip(input)),
            Self::Dynamic => (0..count).try_for_each(|_| dynamic::skip_value(input)),
            Self::Bool | Self::Enum(_) | Self::Scalar(_) => Ok(()),
        }
    }

    fn collect_refs(
        &self,
        input: &mut Input<'_>,
        count: u64,
        width: NumberSize,
        store: &ChunkStore,
        out: &mut Vec<ChunkPointer>,
    ) -> CodecResult<()> {
        match self {
            Self::Struct(p) => (0..count).try_for_each(|_| p.collect_refs(input, store, out)),
            _ => self.skip(input, count, width),
        }
    }
}

fn enum_ordinal(field: &str, def: &EnumDef, value: &Value) -> CodecResult<u64> {
    match value {
        Value::Enum { name, ordinal } if name == def.name() && (*ordinal as usize) < def.len() => {
            Ok(u64::from(*ordinal))
        }
        _ => Err(mismatch(field, def.name(), value)),
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Codec for one declared field.
#[derive(Clone, Debug)]
pub enum IoField {
    /// A single bit in the group.
    Bool,
    /// An ordinal in the group.
    Enum(Arc<EnumDef>),
    Scalar(Scalar),
    /// Width flag in the group, value at that width.
    VarInt { signed: bool },
    Text,
    Blob,
    FixedArray { elem: ElemCodec, len: usize },
    List(ElemCodec),
    Inline(Arc<StructPipe>),
    /// 16-byte reference to a struct stored in its own chain.
    Reference(Arc<StructPipe>),
    DynamicInline,
    DynamicRef,
    /// Universe id in the group selects the variant pipe. Fixed-size
    /// structs pad every variant to `pad_to` bytes.
    Sealed {
        variants: Vec<Arc<StructPipe>>,
        pad_to: Option<u64>,
    },
}

impl IoField {
    pub(crate) fn compile(
        schema: &str,
        def: &FieldDef,
        flavor: PipeFlavor,
        catalog: &mut PipeCatalog,
    ) -> CodecResult<Self> {
        let field = def.name.as_str();
        let codec = if let Some(s) = Scalar::of(&def.ty) {
            Self::Scalar(s)
        } else {
            match &def.ty {
                FieldType::Bool => Self::Bool,
                FieldType::Enum(d) if d.is_empty() => return Err(unsupported(schema, field, "enum has no variants")),
                FieldType::Enum(d) => Self::Enum(d.clone()),
                FieldType::VarInt => Self::VarInt { signed: true },
                FieldType::VarUInt => Self::VarInt { signed: false },
                FieldType::Str => Self::Text,
                FieldType::Bytes => Self::Blob,
                FieldType::FixedArray { elem, len } => Self::FixedArray {
                    elem: ElemCodec::compile(schema, field, elem, flavor, catalog)?,
                    len: *len,
                },
                FieldType::List(elem) => Self::List(ElemCodec::compile(schema, field, elem, flavor, catalog)?),
                FieldType::Struct(s) => Self::Inline(catalog.compile(s, flavor)?),
                FieldType::StructRef(s) => Self::Reference(catalog.compile(s, PipeFlavor::Contiguous)?),
                FieldType::Dynamic => Self::DynamicInline,
                FieldType::DynamicRef => Self::DynamicRef,
                FieldType::Sealed(schemas) if schemas.is_empty() => {
                    return Err(unsupported(schema, field, "sealed field has no variants"))
                }
                FieldType::Sealed(schemas) => {
                    let variants = schemas
                        .iter()
                        .map(|s| catalog.compile(s, flavor))
                        .collect::<CodecResult<Vec<_>>>()?;
                    let pad_to = match flavor {
                        PipeFlavor::Fixed => variants.iter().filter_map(|p| p.fixed_size()).max(),
                        PipeFlavor::Contiguous => None,
                    };
                    Self::Sealed { variants, pad_to }
                }
                _ => return Err(unsupported(schema, field, format!("no codec for {}", def.ty))),
            }
        };
        if flavor == PipeFlavor::Fixed && codec.fixed_size().is_none() {
            return Err(unsupported(
                schema,
                field,
                format!("{} has no fixed size", codec.kind_name()),
            ));
        }
        Ok(codec)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Enum(_) => "enum",
            Self::Scalar(s) => s.name(),
            Self::VarInt { .. } => "varint",
            Self::Text => "str",
            Self::Blob => "bytes",
            Self::FixedArray { .. } => "fixed array",
            Self::List(_) => "list",
            Self::Inline(_) => "struct",
            Self::Reference(_) => "struct reference",
            Self::DynamicInline => "dynamic",
            Self::DynamicRef => "dynamic reference",
            Self::Sealed { .. } => "sealed struct",
        }
    }

    /// Bit-group members besides the null flag, in layout order.
    pub(crate) fn bit_members(&self) -> Vec<(BitRole, u32)> {
        let flag = NumberSize::FLAG_BITS;
        match self {
            Self::Bool => vec![(BitRole::Value, 1)],
            Self::Enum(def) => vec![(BitRole::Value, def.bits())],
            Self::VarInt { .. } | Self::Text | Self::Blob => vec![(BitRole::Width, flag)],
            Self::FixedArray {
                elem: ElemCodec::Var { .. },
                ..
            } => vec![(BitRole::ElemWidth, flag)],
            Self::List(ElemCodec::Var { .. }) => vec![(BitRole::Width, flag), (BitRole::ElemWidth, flag)],
            Self::List(_) => vec![(BitRole::Width, flag)],
            Self::Sealed { variants, .. } => vec![(BitRole::Universe, bits_for_universe(variants.len()))],
            Self::DynamicInline | Self::DynamicRef => vec![(BitRole::TypeIdWidth, flag)],
            Self::Scalar(_) | Self::FixedArray { .. } | Self::Inline(_) | Self::Reference(_) => Vec::new(),
        }
    }

    /// Byte size independent of the value, if there is one.
    pub fn fixed_size(&self) -> Option<u64> {
        match self {
            Self::Bool | Self::Enum(_) => Some(0),
            Self::Scalar(s) => Some(s.width()),
            Self::FixedArray { elem, len } => elem.fixed_size(*len as u64),
            Self::Inline(p) => p.fixed_size(),
            Self::Reference(_) => Some(Reference::ENCODED_LEN as u64),
            Self::Sealed { pad_to: Some(n), .. } => Some(*n),
            Self::Sealed { variants, pad_to: None } => {
                let first = variants.first()?.fixed_size()?;
                variants
                    .iter()
                    .all(|p| p.fixed_size() == Some(first))
                    .then_some(first)
            }
            Self::VarInt { .. } | Self::Text | Self::Blob | Self::List(_) | Self::DynamicInline | Self::DynamicRef => {
                None
            }
        }
    }

    /// Byte size of a present `value`, generated values included. Types are
    /// resolved with [`TypeRegistry::peek_id`], so the size is exact once
    /// the value is staged.
    pub fn size(&self, value: &Value, registry: &TypeRegistry) -> u64 {
        if let Some(n) = self.fixed_size() {
            return n;
        }
        match (self, value) {
            (Self::VarInt { signed: true }, Value::Int(v)) => NumberSize::by_size_signed(*v).bytes() as u64,
            (Self::VarInt { signed: false }, Value::UInt(v)) => NumberSize::by_size(*v).bytes() as u64,
            (Self::Text, Value::Str(s)) => NumberSize::by_size(s.len() as u64).bytes() as u64 + s.len() as u64,
            (Self::Blob, Value::Bytes(b)) => NumberSize::by_size(b.len() as u64).bytes() as u64 + b.len() as u64,
            (Self::FixedArray { elem, .. }, Value::List(items)) => elem.size(items, registry),
            (Self::List(elem), Value::List(items)) => {
                NumberSize::by_size(items.len() as u64).bytes() as u64 + elem.size(items, registry)
            }
            (Self::Inline(p), Value::Record(r)) => p.size_of(r, registry),
            (Self::DynamicInline, v) => {
                let id = dynamic::peek_id(v, registry);
                NumberSize::by_size(u64::from(id)).bytes() as u64 + dynamic::payload_size(v, registry)
            }
            (Self::DynamicRef, v) => {
                let id = dynamic::peek_id(v, registry);
                NumberSize::by_size(u64::from(id)).bytes() as u64 + Reference::ENCODED_LEN as u64
            }
            (Self::Sealed { variants, .. }, Value::Record(r)) => variants
                .iter()
                .find(|p| p.fingerprint() == r.schema().fingerprint())
                .map_or(0, |p| p.size_of(r, registry)),
            _ => 0,
        }
    }

    /// Compute every generated value of a present field. Out-of-line data
    /// is allocated here.
    pub(crate) fn stage(
        &self,
        field: &str,
        value: &Value,
        registry: &mut TypeRegistry,
        store: &mut ChunkStore,
        config: &CodecConfig,
    ) -> CodecResult<Slot> {
        let mut slot = Slot::default();
        let bad = || mismatch(field, self.kind_name(), value);
        match (self, value) {
            (Self::VarInt { signed: true }, Value::Int(v)) => slot.width = Some(NumberSize::by_size_signed(*v)),
            (Self::VarInt { signed: false }, Value::UInt(v)) => slot.width = Some(NumberSize::by_size(*v)),
            (Self::VarInt { .. }, _) => return Err(bad()),
            (Self::Text, Value::Str(s)) => {
                slot.width = Some(NumberSize::by_size(s.len() as u64));
                slot.length = Some(s.len() as u64);
            }
            (Self::Blob, Value::Bytes(b)) => {
                slot.width = Some(NumberSize::by_size(b.len() as u64));
                slot.length = Some(b.len() as u64);
            }
            (Self::Text | Self::Blob, _) => return Err(bad()),
            (Self::FixedArray { elem, len }, Value::List(items)) => {
                if items.len() != *len {
                    return Err(bad());
                }
                elem.stage(field, items, &mut slot, registry, store, config)?;
            }
            (Self::List(elem), Value::List(items)) => {
                slot.width = Some(NumberSize::by_size(items.len() as u64));
                slot.length = Some(items.len() as u64);
                elem.stage(field, items, &mut slot, registry, store, config)?;
            }
            (Self::FixedArray { .. } | Self::List(_), _) => return Err(bad()),
            (Self::Inline(p), Value::Record(r)) => slot.nested.push(p.stage(r, registry, store, config)?),
            (Self::Reference(p), Value::Record(r)) => {
                let (bytes, staged) = p.encode_staged(r, registry, store, config)?;
                match store.allocate(AllocateTicket::with_data(bytes)) {
                    Ok(chunk) => slot.reference = Some(chunk.ptr.at(0)),
                    Err(e) => return Err(p.abandon(&staged, store, e.into())),
                }
            }
            (Self::Inline(_) | Self::Reference(_), _) => return Err(bad()),
            (Self::DynamicInline, v) => {
                slot.type_id = Some(dynamic::stage(v, registry, config.allow_register)?);
            }
            (Self::DynamicRef, v) => {
                slot.type_id = Some(dynamic::stage(v, registry, config.allow_register)?);
                let payload = dynamic::encode_payload(v, registry)?;
                let chunk = store.allocate(AllocateTicket::with_data(payload))?;
                slot.reference = Some(chunk.ptr.at(0));
            }
            (Self::Sealed { variants, .. }, Value::Record(r)) => {
                let index = variants
                    .iter()
                    .position(|p| p.fingerprint() == r.schema().fingerprint())
                    .ok_or_else(bad)?;
                slot.universe = Some(index as u64);
                slot.nested.push(variants[index].stage(r, registry, store, config)?);
            }
            (Self::Sealed { .. }, _) => return Err(bad()),
            (Self::Bool | Self::Enum(_) | Self::Scalar(_), _) => {}
        }
        Ok(slot)
    }

    /// Free the chains allocated when `slot` was staged, along with the
    /// chains owned by a referenced record. Returns the number freed.
    pub(crate) fn release(&self, slot: &Slot, store: &mut ChunkStore) -> CodecResult<usize> {
        match self {
            Self::Reference(p) => match slot.reference {
                Some(r) => {
                    let owned = p.free_out_of_line(store, r)?;
                    store.free_chain(r.ptr)?;
                    Ok(owned + 1)
                }
                None => Ok(0),
            },
            Self::DynamicRef => match slot.reference {
                Some(r) => {
                    store.free_chain(r.ptr)?;
                    Ok(1)
                }
                None => Ok(0),
            },
            Self::Inline(p)
            | Self::FixedArray {
                elem: ElemCodec::Struct(p),
                ..
            }
            | Self::List(ElemCodec::Struct(p)) => release_nested(p, &slot.nested, store),
            Self::Sealed { variants, .. } => match slot.universe {
                Some(u) => release_nested(variant(variants, u)?, &slot.nested, store),
                None => Ok(0),
            },
            _ => Ok(0),
        }
    }

    /// Value of one bit-group member of a present field.
    pub(crate) fn bit_value(&self, field: &str, role: BitRole, value: &Value, slot: &Slot) -> CodecResult<u64> {
        Ok(match role {
            BitRole::Null => 0,
            BitRole::Width => u64::from(slot.width.ok_or_else(|| missing(field, "width"))?.ordinal()),
            BitRole::ElemWidth => u64::from(
                slot.elem_width
                    .ok_or_else(|| missing(field, "element width"))?
                    .ordinal(),
            ),
            BitRole::Universe => slot.universe.ok_or_else(|| missing(field, "universe id"))?,
            BitRole::TypeIdWidth => {
                let id = slot.type_id.ok_or_else(|| missing(field, "type id"))?;
                u64::from(NumberSize::by_size(u64::from(id)).ordinal())
            }
            BitRole::Value => match (self, value) {
                (Self::Bool, Value::Bool(b)) => u64::from(*b),
                (Self::Enum(def), v) => enum_ordinal(field, def, v)?,
                _ => return Err(mismatch(field, self.kind_name(), value)),
            },
        })
    }

    /// Write the byte part of a present field.
    pub(crate) fn write(
        &self,
        field: &str,
        value: &Value,
        slot: &Slot,
        registry: &TypeRegistry,
        config: &CodecConfig,
        out: &mut Vec<u8>,
    ) -> CodecResult<()> {
        let bad = || mismatch(field, self.kind_name(), value);
        match (self, value) {
            (Self::Bool | Self::Enum(_), _) => {}
            (Self::Scalar(s), v) => s.write(field, v, out)?,
            (Self::VarInt { signed }, v) => {
                let width = slot.width.ok_or_else(|| missing(field, "width"))?;
                match (signed, v) {
                    (true, Value::Int(i)) => width.write_signed_to(out, *i)?,
                    (false, Value::UInt(u)) => width.write_to(out, *u)?,
                    _ => return Err(bad()),
                }
            }
            (Self::Text, Value::Str(s)) => write_sized(field, s.as_bytes(), slot, out)?,
            (Self::Blob, Value::Bytes(b)) => write_sized(field, b, slot, out)?,
            (Self::FixedArray { elem, len }, Value::List(items)) if items.len() == *len => {
                elem.write(field, items, slot, registry, config, out)?;
            }
            (Self::List(elem), Value::List(items)) => {
                let width = slot.width.ok_or_else(|| missing(field, "width"))?;
                let length = slot.length.ok_or_else(|| missing(field, "length"))?;
                if length != items.len() as u64 {
                    return Err(CodecError::InvalidValue(format!(
                        "field {field} staged with {length} elements, has {}",
                        items.len()
                    )));
                }
                width.write_to(out, length)?;
                elem.write(field, items, slot, registry, config, out)?;
            }
            (Self::Inline(p), Value::Record(r)) => {
                let staged = slot.nested.first().ok_or_else(|| missing(field, "nested struct"))?;
                p.write_staged(r, staged, registry, config, out)?;
            }
            (Self::Reference(_), Value::Record(_)) => {
                let r = slot.reference.ok_or_else(|| CodecError::ReferenceNotAllocated {
                    field: field.to_string(),
                })?;
                out.extend_from_slice(&r.to_bytes());
            }
            (Self::DynamicInline, v) => {
                let id = slot.type_id.ok_or_else(|| missing(field, "type id"))?;
                NumberSize::by_size(u64::from(id)).write_to(out, u64::from(id))?;
                dynamic::write_payload(v, registry, out)?;
            }
            (Self::DynamicRef, _) => {
                let id = slot.type_id.ok_or_else(|| missing(field, "type id"))?;
                let r = slot.reference.ok_or_else(|| CodecError::ReferenceNotAllocated {
                    field: field.to_string(),
                })?;
                NumberSize::by_size(u64::from(id)).write_to(out, u64::from(id))?;
                out.extend_from_slice(&r.to_bytes());
            }
            (Self::Sealed { variants, pad_to }, Value::Record(r)) => {
                let index = slot.universe.ok_or_else(|| missing(field, "universe id"))?;
                let pipe = variants.get(index as usize).ok_or_else(bad)?;
                let staged = slot.nested.first().ok_or_else(|| missing(field, "nested struct"))?;
                let start = out.len();
                pipe.write_staged(r, staged, registry, config, out)?;
                if let Some(n) = pad_to {
                    let written = (out.len() - start) as u64;
                    out.resize(out.len() + n.saturating_sub(written) as usize, 0);
                }
            }
            _ => return Err(bad()),
        }
        Ok(())
    }

    /// Read the byte part of a present field.
    pub(crate) fn read(&self, input: &mut Input<'_>, bits: &FieldBits, ctx: &ReadCtx<'_>) -> CodecResult<Value> {
        Ok(match self {
            Self::Bool => Value::Bool(bits.value != 0),
            Self::Enum(def) => {
                if bits.value >= def.len() as u64 {
                    return Err(TypeError::InvalidEnumOrdinal {
                        ordinal: bits.value,
                        universe: def.len(),
                    }
                    .into());
                }
                Value::Enum {
                    name: def.name().to_string(),
                    ordinal: bits.value as u32,
                }
            }
            Self::Scalar(s) => s.read(input)?,
            Self::VarInt { signed: true } => Value::Int(bits.width.read_signed_from(input)?),
            Self::VarInt { signed: false } => Value::UInt(bits.width.read_from(input)?),
            Self::Text => {
                let len = bits.width.read_from(input)?;
                Value::Str(read_string(input, len)?)
            }
            Self::Blob => {
                let len = bits.width.read_from(input)?;
                Value::Bytes(read_vec(input, len)?)
            }
            Self::FixedArray { elem, len } => Value::List(elem.read(input, *len as u64, bits.elem_width, ctx)?),
            Self::List(elem) => {
                let count = bits.width.read_from(input)?;
                Value::List(elem.read(input, count, bits.elem_width, ctx)?)
            }
            Self::Inline(p) => Value::Record(p.decode(input, ctx)?),
            Self::Reference(p) => {
                let r = read_reference(input)?;
                let bytes = referenced(ctx.store, r)?;
                let mut sub = Cursor::new(bytes.as_slice());
                sub.set_position(r.offset);
                Value::Record(p.decode(&mut sub, ctx)?)
            }
            Self::DynamicInline => {
                let id = read_type_id(input, bits.id_width)?;
                dynamic::read_payload(input, id, ctx)?
            }
            Self::DynamicRef => {
                let id = read_type_id(input, bits.id_width)?;
                let r = read_reference(input)?;
                let bytes = referenced(ctx.store, r)?;
                let mut sub = Cursor::new(bytes.as_slice());
                sub.set_position(r.offset);
                dynamic::read_payload(&mut sub, id, ctx)?
            }
            Self::Sealed { variants, pad_to } => {
                let pipe = variant(variants, bits.universe)?;
                let start = input.position();
                let record = pipe.decode(input, ctx)?;
                if let Some(n) = pad_to {
                    skip(input, n.saturating_sub(input.position() - start))?;
                }
                Value::Record(record)
            }
        })
    }

    /// Step over the byte part of a present field.
    pub(crate) fn skip(&self, input: &mut Input<'_>, bits: &FieldBits) -> CodecResult<()> {
        if let Some(n) = self.fixed_size() {
            return skip(input, n);
        }
        match self {
            Self::VarInt { .. } => skip(input, bits.width.bytes() as u64),
            Self::Text | Self::Blob => {
                let len = bits.width.read_from(input)?;
                skip(input, len)
            }
            Self::FixedArray { elem, len } => elem.skip(input, *len as u64, bits.elem_width),
            Self::List(elem) => {
                let count = bits.width.read_from(input)?;
                elem.skip(input, count, bits.elem_width)
            }
            Self::Inline(p) => p.skip(input),
            Self::DynamicInline => {
                read_type_id(input, bits.id_width)?;
                dynamic::skip_payload(input)
            }
            Self::DynamicRef => skip(input, bits.id_width.bytes() as u64 + Reference::ENCODED_LEN as u64),
            Self::Sealed { variants, .. } => variant(variants, bits.universe)?.skip(input),
            Self::Bool | Self::Enum(_) | Self::Scalar(_) | Self::Reference(_) => Ok(()),
        }
    }

    /// Step over a present field, collecting every chain head it owns.
    pub(crate) fn collect_refs(
        &self,
        input: &mut Input<'_>,
        bits: &FieldBits,
        store: &ChunkStore,
        out: &mut Vec<ChunkPointer>,
    ) -> CodecResult<()> {
        match self {
            Self::Reference(p) => {
                let r = read_reference(input)?;
                let bytes = referenced(store, r)?;
                let mut sub = Cursor::new(bytes.as_slice());
                sub.set_position(r.offset);
                p.collect_refs(&mut sub, store, out)?;
                out.push(r.ptr);
                Ok(())
            }
            Self::DynamicRef => {
                skip(input, bits.id_width.bytes() as u64)?;
                out.push(read_reference(input)?.ptr);
                Ok(())
            }
            Self::Inline(p) => p.collect_refs(input, store, out),
            Self::FixedArray { elem, len } => elem.collect_refs(input, *len as u64, bits.elem_width, store, out),
            Self::List(elem) => {
                let count = bits.width.read_from(input)?;
                elem.collect_refs(input, count, bits.elem_width, store, out)
            }
            Self::Sealed { variants, pad_to } => {
                let start = input.position();
                variant(variants, bits.universe)?.collect_refs(input, store, out)?;
                if let Some(n) = pad_to {
                    skip(input, n.saturating_sub(input.position() - start))?;
                }
                Ok(())
            }
            _ => self.skip(input, bits),
        }
    }
}

fn write_sized(field: &str, data: &[u8], slot: &Slot, out: &mut Vec<u8>) -> CodecResult<()> {
    let width = slot.width.ok_or_else(|| missing(field, "width"))?;
    let length = slot.length.ok_or_else(|| missing(field, "length"))?;
    if length != data.len() as u64 {
        return Err(CodecError::InvalidValue(format!(
            "field {field} staged with length {length}, has {}",
            data.len()
        )));
    }
    width.write_to(out, length)?;
    out.extend_from_slice(data);
    Ok(())
}

fn release_nested(p: &StructPipe, nested: &[Staged], store: &mut ChunkStore) -> CodecResult<usize> {
    nested
        .iter()
        .try_fold(0, |freed, staged| Ok(freed + p.release(staged, store)?))
}

fn abandon_nested(p: &StructPipe, nested: &[Staged], store: &mut ChunkStore, cause: CodecError) -> CodecError {
    if let Err(e) = release_nested(p, nested, store) {
        warn!(schema = p.schema().name(), error = %e, "could not release staged chains");
    }
    cause
}

fn read_type_id(input: &mut Input<'_>, width: NumberSize) -> CodecResult<u32> {
    let id = width.read_from(input)?;
    u32::try_from(id).map_err(|_| CodecError::InvalidValue(format!("type id {id} out of range")))
}

fn variant(variants: &[Arc<StructPipe>], universe: u64) -> CodecResult<&Arc<StructPipe>> {
    variants
        .get(universe as usize)
        .ok_or_else(|| CodecError::InvalidValue(format!("sealed universe id {universe} out of range")))
}
