use std::fmt;
use std::sync::Arc;

use chunkdb_registry::Fingerprint;
use chunkdb_types::bits_for_universe;

use crate::value::{Record, Value};

/// A closed set of named variants, stored as an ordinal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumDef {
    name: String,
    variants: Vec<String>,
}

impl EnumDef {
    pub fn new<I, S>(name: impl Into<String>, variants: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            name: name.into(),
            variants: variants.into_iter().map(Into::into).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variants(&self) -> &[String] {
        &self.variants
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Bits an ordinal of this enum takes in a bit group.
    pub fn bits(&self) -> u32 {
        bits_for_universe(self.variants.len())
    }

    pub fn ordinal_of(&self, variant: &str) -> Option<u32> {
        self.variants
            .iter()
            .position(|v| v == variant)
            .map(|i| i as u32)
    }

    /// The enum value for `variant`, if it exists.
    pub fn value(&self, variant: &str) -> Option<Value> {
        self.ordinal_of(variant).map(|ordinal| Value::Enum {
            name: self.name.clone(),
            ordinal,
        })
    }
}

/// How a field treats an absent value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Nullability {
    /// Absence is rejected when the field is assigned.
    #[default]
    NotNull,
    /// Absence is stored as a set null flag and no payload.
    Nullable,
    /// Absence is replaced by the type's default when the field is assigned.
    DefaultIfNull,
}

/// Declared shape of one field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    Bool,
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
    Char,
    /// Signed integer stored at the narrowest [`NumberSize`](chunkdb_types::NumberSize)
    /// that holds it.
    VarInt,
    /// Unsigned integer stored at the narrowest width that holds it.
    VarUInt,
    Enum(Arc<EnumDef>),
    Str,
    Bytes,
    /// Exactly `len` elements, no stored length.
    FixedArray { elem: Box<FieldType>, len: usize },
    /// Growable list with a stored length.
    List(Box<FieldType>),
    /// Nested struct written inline.
    Struct(Arc<Schema>),
    /// Nested struct written to its own chunk chain; only a reference is
    /// stored inline.
    StructRef(Arc<Schema>),
    /// Any value, tagged with its registry type id, written inline.
    Dynamic,
    /// Any value written to its own chain; the type id and a reference are
    /// stored inline.
    DynamicRef,
    /// One of a closed set of struct types, selected by a small universe id.
    Sealed(Vec<Arc<Schema>>),
}

impl FieldType {
    pub fn list(elem: FieldType) -> Self {
        Self::List(Box::new(elem))
    }

    pub fn fixed_array(elem: FieldType, len: usize) -> Self {
        Self::FixedArray {
            elem: Box::new(elem),
            len,
        }
    }

    /// Canonical value used for `DefaultIfNull` and fresh records.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::VarInt | Self::Dynamic | Self::DynamicRef => {
                Value::Int(0)
            }
            Self::U8 | Self::U16 | Self::U32 | Self::U64 | Self::VarUInt => Value::UInt(0),
            Self::F32 | Self::F64 => Value::Float(0.0),
            Self::Char => Value::Char('\0'),
            Self::Enum(def) => Value::Enum {
                name: def.name().to_string(),
                ordinal: 0,
            },
            Self::Str => Value::Str(String::new()),
            Self::Bytes => Value::Bytes(Vec::new()),
            Self::FixedArray { elem, len } => Value::List(vec![elem.default_value(); *len]),
            Self::List(_) => Value::List(Vec::new()),
            Self::Struct(schema) | Self::StructRef(schema) => Value::Record(Record::new(schema.clone())),
            Self::Sealed(variants) => match variants.first() {
                Some(schema) => Value::Record(Record::new(schema.clone())),
                None => Value::List(Vec::new()),
            },
        }
    }

    /// `true` if `value` can be stored in a field of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Bool, Value::Bool(_)) => true,
            (Self::I8, Value::Int(v)) => i8::try_from(*v).is_ok(),
            (Self::I16, Value::Int(v)) => i16::try_from(*v).is_ok(),
            (Self::I32, Value::Int(v)) => i32::try_from(*v).is_ok(),
            (Self::I64 | Self::VarInt, Value::Int(_)) => true,
            (Self::U8, Value::UInt(v)) => u8::try_from(*v).is_ok(),
            (Self::U16, Value::UInt(v)) => u16::try_from(*v).is_ok(),
            (Self::U32, Value::UInt(v)) => u32::try_from(*v).is_ok(),
            (Self::U64 | Self::VarUInt, Value::UInt(_)) => true,
            (Self::F32, Value::Float(v)) => fits_f32(*v),
            (Self::F64, Value::Float(_)) => true,
            (Self::Char, Value::Char(_)) => true,
            (Self::Enum(def), Value::Enum { name, ordinal }) => {
                name == def.name() && (*ordinal as usize) < def.len()
            }
            (Self::Str, Value::Str(_)) => true,
            (Self::Bytes, Value::Bytes(_)) => true,
            (Self::FixedArray { elem, len }, Value::List(items)) => {
                items.len() == *len && items.iter().all(|v| elem.accepts(v))
            }
            (Self::List(elem), Value::List(items)) => items.iter().all(|v| elem.accepts(v)),
            (Self::Struct(schema) | Self::StructRef(schema), Value::Record(record)) => {
                record.schema().fingerprint() == schema.fingerprint()
            }
            (Self::Sealed(variants), Value::Record(record)) => {
                variants.iter().any(|s| s.fingerprint() == record.schema().fingerprint())
            }
            (Self::Dynamic | Self::DynamicRef, value) => value.is_dynamic_storable(),
            _ => false,
        }
    }

    fn describe_into(&self, out: &mut String) {
        use std::fmt::Write as _;
        let _ = match self {
            Self::Bool => write!(out, "bool"),
            Self::I8 => write!(out, "i8"),
            Self::I16 => write!(out, "i16"),
            Self::I32 => write!(out, "i32"),
            Self::I64 => write!(out, "i64"),
            Self::U8 => write!(out, "u8"),
            Self::U16 => write!(out, "u16"),
            Self::U32 => write!(out, "u32"),
            Self::U64 => write!(out, "u64"),
            Self::F32 => write!(out, "f32"),
            Self::F64 => write!(out, "f64"),
            Self::Char => write!(out, "char"),
            Self::VarInt => write!(out, "varint"),
            Self::VarUInt => write!(out, "varuint"),
            Self::Enum(def) => write!(out, "enum {}[{}]", def.name(), def.variants().join("|")),
            Self::Str => write!(out, "str"),
            Self::Bytes => write!(out, "bytes"),
            Self::FixedArray { elem, len } => {
                out.push('[');
                elem.describe_into(out);
                write!(out, ";{len}]")
            }
            Self::List(elem) => {
                out.push_str("list<");
                elem.describe_into(out);
                write!(out, ">")
            }
            Self::Struct(schema) => write!(out, "struct {}#{}", schema.name(), schema.fingerprint().short()),
            Self::StructRef(schema) => write!(out, "ref {}#{}", schema.name(), schema.fingerprint().short()),
            Self::Dynamic => write!(out, "dyn"),
            Self::DynamicRef => write!(out, "dynref"),
            Self::Sealed(variants) => {
                out.push_str("sealed<");
                for (i, schema) in variants.iter().enumerate() {
                    if i > 0 {
                        out.push('|');
                    }
                    let _ = write!(out, "{}#{}", schema.name(), schema.fingerprint().short());
                }
                write!(out, ">")
            }
        };
    }

    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out);
        out
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// One declared field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub nullability: Nullability,
}

/// Ahead-of-time description of a struct type.
///
/// Field order is part of the stored format. A schema is immutable once
/// built; its fingerprint covers its name, every field, and (through their
/// fingerprints) every nested schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    name: String,
    fields: Vec<FieldDef>,
    fingerprint: Fingerprint,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Arc<Self> {
        let name = name.into();
        let fingerprint = Fingerprint::of(describe(&name, &fields).as_bytes());
        Arc::new(Self {
            name,
            fields,
            fingerprint,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == field)
    }

    pub fn field(&self, field: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == field)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Canonical text form hashed into the fingerprint.
    pub fn describe(&self) -> String {
        describe(&self.name, &self.fields)
    }
}

/// `true` if `v` survives a trip through `f32` unchanged. NaN counts.
pub(crate) fn fits_f32(v: f64) -> bool {
    v.is_nan() || f64::from(v as f32) == v
}

fn describe(name: &str, fields: &[FieldDef]) -> String {
    let mut out = format!("{name}{{");
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&field.name);
        out.push(':');
        field.ty.describe_into(&mut out);
        match field.nullability {
            Nullability::NotNull => {}
            Nullability::Nullable => out.push('?'),
            Nullability::DefaultIfNull => out.push('~'),
        }
    }
    out.push('}');
    out
}

/// Collects fields in declaration order.
#[derive(Clone, Debug)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldDef>,
}

impl SchemaBuilder {
    pub fn with(mut self, name: impl Into<String>, ty: FieldType, nullability: Nullability) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            ty,
            nullability,
        });
        self
    }

    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with(name, ty, Nullability::NotNull)
    }

    pub fn nullable(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with(name, ty, Nullability::Nullable)
    }

    pub fn default_if_null(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with(name, ty, Nullability::DefaultIfNull)
    }

    pub fn build(self) -> Arc<Schema> {
        Schema::new(self.name, self.fields)
    }
}
