//! Self-describing value codec for dynamically typed fields.
//!
//! A full value is `[id width byte][type id][payload]`. A payload starts with
//! a tag byte, `kind | width << 4`, where `width` is the NumberSize ordinal of
//! the kind's leading number (the value itself, or a length or count).
//!
//! | kind | payload after the tag |
//! |------|-----------------------|
//! | 0 bool | one byte |
//! | 1 int, 2 uint | the value at `width` |
//! | 3 float | `f64` LE |
//! | 4 char | scalar value at `width` |
//! | 5 str, 6 bytes | length at `width`, data |
//! | 7 list | count at `width`, full values |
//! | 8 enum | ordinal at `width` |
//! | 9 struct | field count at `width`, per field a presence byte and a full value |
//!
//! Payloads can be skipped without consulting the registry, so a lenient
//! reader steps over values whose type id it does not know.

use chunkdb_registry::{RegistryError, TypeKey, TypeRegistry};
use chunkdb_types::NumberSize;

use crate::cursor::{read_array, read_u8, read_vec, skip, Input};
use crate::error::{CodecError, CodecResult};
use crate::pipe::ReadCtx;
use crate::value::{Record, Value};

const KIND_BOOL: u8 = 0;
const KIND_INT: u8 = 1;
const KIND_UINT: u8 = 2;
const KIND_FLOAT: u8 = 3;
const KIND_CHAR: u8 = 4;
const KIND_STR: u8 = 5;
const KIND_BYTES: u8 = 6;
const KIND_LIST: u8 = 7;
const KIND_ENUM: u8 = 8;
const KIND_STRUCT: u8 = 9;

/// Registry key a value is tagged with.
pub fn key_of(value: &Value) -> CodecResult<TypeKey> {
    Ok(match value {
        Value::Bool(_) => TypeKey::Bool,
        Value::Int(_) => TypeKey::Int,
        Value::UInt(_) => TypeKey::UInt,
        Value::Float(_) => TypeKey::Float,
        Value::Char(_) => TypeKey::Char,
        Value::Str(_) => TypeKey::Str,
        Value::Bytes(_) => TypeKey::Bytes,
        Value::List(_) => TypeKey::List,
        Value::Enum { name, .. } => TypeKey::enum_named(name.clone()),
        Value::Record(r) => TypeKey::struct_named(r.schema().name()),
        Value::Unknown { type_id } => {
            return Err(CodecError::InvalidValue(format!(
                "value of unknown type {type_id} cannot be stored"
            )))
        }
    })
}

/// The id `value` has or would receive, for size computations.
pub(crate) fn peek_id(value: &Value, registry: &TypeRegistry) -> u32 {
    key_of(value).map(|k| registry.peek_id(&k)).unwrap_or(0)
}

/// Register the type of `value` and of everything nested in it. Struct
/// types are registered with their schema fingerprint.
pub fn stage(value: &Value, registry: &mut TypeRegistry, allow_register: bool) -> CodecResult<u32> {
    match value {
        Value::List(items) => {
            for item in items {
                stage(item, registry, allow_register)?;
            }
        }
        Value::Record(record) => {
            for v in record.values().iter().flatten() {
                stage(v, registry, allow_register)?;
            }
            let key = key_of(value)?;
            let fingerprint = record.schema().fingerprint();
            return Ok(registry.to_id_with_fingerprint(&key, fingerprint, allow_register)?);
        }
        _ => {}
    }
    Ok(registry.to_id(&key_of(value)?, allow_register)?)
}

fn head(value: &Value) -> (u8, NumberSize) {
    match value {
        Value::Bool(_) => (KIND_BOOL, NumberSize::Void),
        Value::Int(v) => (KIND_INT, NumberSize::by_size_signed(*v)),
        Value::UInt(v) => (KIND_UINT, NumberSize::by_size(*v)),
        Value::Float(_) => (KIND_FLOAT, NumberSize::Long),
        Value::Char(c) => (KIND_CHAR, NumberSize::by_size(u64::from(*c))),
        Value::Str(s) => (KIND_STR, NumberSize::by_size(s.len() as u64)),
        Value::Bytes(b) => (KIND_BYTES, NumberSize::by_size(b.len() as u64)),
        Value::List(items) => (KIND_LIST, NumberSize::by_size(items.len() as u64)),
        Value::Enum { ordinal, .. } => (KIND_ENUM, NumberSize::by_size(u64::from(*ordinal))),
        Value::Record(r) => (KIND_STRUCT, NumberSize::by_size(r.values().len() as u64)),
        Value::Unknown { .. } => (KIND_BOOL, NumberSize::Void),
    }
}

fn id_size(id: u32) -> u64 {
    1 + NumberSize::by_size(u64::from(id)).bytes() as u64
}

/// Encoded size of the payload of `value`, tag included.
pub fn payload_size(value: &Value, registry: &TypeRegistry) -> u64 {
    let (_, width) = head(value);
    let w = width.bytes() as u64;
    let body = match value {
        Value::Bool(_) => 1,
        Value::Float(_) => 8,
        Value::Int(_) | Value::UInt(_) | Value::Char(_) | Value::Enum { .. } => w,
        Value::Str(s) => w + s.len() as u64,
        Value::Bytes(b) => w + b.len() as u64,
        Value::List(items) => w + items.iter().map(|v| value_size(v, registry)).sum::<u64>(),
        Value::Record(r) => {
            w + r
                .values()
                .iter()
                .map(|v| 1 + v.as_ref().map_or(0, |v| value_size(v, registry)))
                .sum::<u64>()
        }
        Value::Unknown { .. } => 0,
    };
    1 + body
}

/// Encoded size of a full value: id flag, id, payload.
pub fn value_size(value: &Value, registry: &TypeRegistry) -> u64 {
    id_size(peek_id(value, registry)) + payload_size(value, registry)
}

pub(crate) fn write_id(out: &mut Vec<u8>, id: u32) -> CodecResult<()> {
    let width = NumberSize::by_size(u64::from(id));
    out.push(width.ordinal());
    width.write_to(out, u64::from(id))?;
    Ok(())
}

pub(crate) fn read_id(input: &mut Input<'_>) -> CodecResult<u32> {
    let width = NumberSize::from_ordinal(read_u8(input)?)?;
    let id = width.read_from(input)?;
    u32::try_from(id).map_err(|_| CodecError::InvalidValue(format!("type id {id} out of range")))
}

/// Id of an already staged value.
pub(crate) fn staged_id(value: &Value, registry: &TypeRegistry) -> CodecResult<u32> {
    let key = key_of(value)?;
    registry
        .lookup(&key)
        .ok_or_else(|| RegistryError::UnknownType(key).into())
}

pub fn write_payload(value: &Value, registry: &TypeRegistry, out: &mut Vec<u8>) -> CodecResult<()> {
    let (kind, width) = head(value);
    out.push(kind | (width.ordinal() << 4));
    match value {
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::Int(v) => width.write_signed_to(out, *v)?,
        Value::UInt(v) => width.write_to(out, *v)?,
        Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Char(c) => width.write_to(out, u64::from(*c))?,
        Value::Str(s) => {
            width.write_to(out, s.len() as u64)?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            width.write_to(out, b.len() as u64)?;
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            width.write_to(out, items.len() as u64)?;
            for item in items {
                write_value(item, registry, out)?;
            }
        }
        Value::Enum { ordinal, .. } => width.write_to(out, u64::from(*ordinal))?,
        Value::Record(r) => {
            width.write_to(out, r.values().len() as u64)?;
            for v in r.values() {
                match v {
                    Some(v) => {
                        out.push(1);
                        write_value(v, registry, out)?;
                    }
                    None => out.push(0),
                }
            }
        }
        Value::Unknown { .. } => {
            key_of(value)?;
        }
    }
    Ok(())
}

/// Write a full value. Its type must already be staged.
pub fn write_value(value: &Value, registry: &TypeRegistry, out: &mut Vec<u8>) -> CodecResult<()> {
    write_id(out, staged_id(value, registry)?)?;
    write_payload(value, registry, out)
}

/// Encode just the payload of `value`, for out-of-line storage.
pub fn encode_payload(value: &Value, registry: &TypeRegistry) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(payload_size(value, registry) as usize);
    write_payload(value, registry, &mut out)?;
    Ok(out)
}

fn read_tag(input: &mut Input<'_>) -> CodecResult<(u8, NumberSize)> {
    let tag = read_u8(input)?;
    Ok((tag & 0x0F, NumberSize::from_ordinal(tag >> 4)?))
}

fn read_len(input: &mut Input<'_>, width: NumberSize) -> CodecResult<u64> {
    Ok(width.read_from(input)?)
}

fn skip_body(input: &mut Input<'_>, kind: u8, width: NumberSize) -> CodecResult<()> {
    match kind {
        KIND_BOOL => skip(input, 1),
        KIND_FLOAT => skip(input, 8),
        KIND_INT | KIND_UINT | KIND_CHAR | KIND_ENUM => skip(input, width.bytes() as u64),
        KIND_STR | KIND_BYTES => {
            let len = read_len(input, width)?;
            skip(input, len)
        }
        KIND_LIST => {
            let count = read_len(input, width)?;
            (0..count).try_for_each(|_| skip_value(input))
        }
        KIND_STRUCT => {
            let count = read_len(input, width)?;
            for _ in 0..count {
                if read_u8(input)? != 0 {
                    skip_value(input)?;
                }
            }
            Ok(())
        }
        other => Err(CodecError::InvalidValue(format!("unknown payload kind {other}"))),
    }
}

pub fn skip_payload(input: &mut Input<'_>) -> CodecResult<()> {
    let (kind, width) = read_tag(input)?;
    skip_body(input, kind, width)
}

pub fn skip_value(input: &mut Input<'_>) -> CodecResult<()> {
    read_id(input)?;
    skip_payload(input)
}

/// Decode a payload tagged with `id`.
pub fn read_payload(input: &mut Input<'_>, id: u32, ctx: &ReadCtx<'_>) -> CodecResult<Value> {
    let key = match ctx.registry.from_id(id) {
        Ok(key) => key,
        Err(e) if ctx.config.lenient_reads && e.is_recoverable() => {
            skip_payload(input)?;
            return Ok(Value::Unknown { type_id: id });
        }
        Err(e) => return Err(e.into()),
    };

    let (kind, width) = read_tag(input)?;
    let value = match (kind, key) {
        (KIND_BOOL, TypeKey::Bool) => Value::Bool(read_u8(input)? != 0),
        (KIND_INT, TypeKey::Int) => Value::Int(width.read_signed_from(input)?),
        (KIND_UINT, TypeKey::UInt) => Value::UInt(width.read_from(input)?),
        (KIND_FLOAT, TypeKey::Float) => Value::Float(f64::from_le_bytes(read_array::<8>(input)?)),
        (KIND_CHAR, TypeKey::Char) => {
            let raw = width.read_from(input)?;
            let c = u32::try_from(raw).ok().and_then(char::from_u32);
            Value::Char(c.ok_or_else(|| CodecError::InvalidValue(format!("invalid char {raw:#x}")))?)
        }
        (KIND_STR, TypeKey::Str) => {
            let len = read_len(input, width)?;
            let bytes = read_vec(input, len)?;
            Value::Str(String::from_utf8(bytes).map_err(|e| CodecError::InvalidValue(e.to_string()))?)
        }
        (KIND_BYTES, TypeKey::Bytes) => {
            let len = read_len(input, width)?;
            Value::Bytes(read_vec(input, len)?)
        }
        (KIND_LIST, TypeKey::List) => {
            let count = read_len(input, width)?;
            let items = (0..count)
                .map(|_| read_value(input, ctx))
                .collect::<CodecResult<Vec<_>>>()?;
            Value::List(items)
        }
        (KIND_ENUM, TypeKey::Enum(name)) => {
            let ordinal = width.read_from(input)?;
            let ordinal = u32::try_from(ordinal)
                .map_err(|_| CodecError::InvalidValue(format!("enum ordinal {ordinal} out of range")))?;
            Value::Enum {
                name: name.clone(),
                ordinal,
            }
        }
        (KIND_STRUCT, TypeKey::Struct(name)) => {
            let Some(schema) = ctx.catalog.schema(name).cloned() else {
                if ctx.config.lenient_reads {
                    skip_body(input, kind, width)?;
                    return Ok(Value::Unknown { type_id: id });
                }
                return Err(CodecError::UnknownSchema(name.clone()));
            };
            ctx.registry.check_fingerprint(id, schema.fingerprint())?;
            let count = read_len(input, width)?;
            if count != schema.fields().len() as u64 {
                return Err(CodecError::InvalidValue(format!(
                    "struct {name} stored with {count} fields, schema has {}",
                    schema.fields().len()
                )));
            }
            let mut values = Vec::with_capacity(schema.fields().len());
            for _ in 0..count {
                values.push(match read_u8(input)? {
                    0 => None,
                    _ => Some(read_value(input, ctx)?),
                });
            }
            Value::Record(Record::from_values(schema, values))
        }
        (kind, key) => {
            return Err(CodecError::InvalidValue(format!(
                "payload kind {kind} does not match type {key}"
            )))
        }
    };
    Ok(value)
}

/// Decode a full value.
pub fn read_value(input: &mut Input<'_>, ctx: &ReadCtx<'_>) -> CodecResult<Value> {
    let id = read_id(input)?;
    read_payload(input, id, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PipeCatalog;
    use crate::config::CodecConfig;
    use crate::schema::{EnumDef, FieldType, Schema};
    use chunkdb_store::ChunkStore;
    use std::io::Cursor;
    use std::sync::Arc;

    fn point() -> Arc<Schema> {
        Schema::builder("Point")
            .field("x", FieldType::I32)
            .nullable("label", FieldType::Str)
            .build()
    }

    fn encode(value: &Value, registry: &mut TypeRegistry) -> Vec<u8> {
        stage(value, registry, true).unwrap();
        let mut out = Vec::new();
        write_value(value, registry, &mut out).unwrap();
        assert_eq!(out.len() as u64, value_size(value, registry));
        out
    }

    fn decode(bytes: &[u8], registry: &TypeRegistry, catalog: &PipeCatalog, config: &CodecConfig) -> CodecResult<Value> {
        let store = ChunkStore::in_memory().unwrap();
        let ctx = ReadCtx {
            store: &store,
            registry,
            catalog,
            config,
        };
        let mut input = Cursor::new(bytes);
        let value = read_value(&mut input, &ctx)?;
        assert_eq!(input.position(), bytes.len() as u64);
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    #[test]
    fn small_int_is_three_bytes() {
        let mut reg = TypeRegistry::new();
        let bytes = encode(&Value::Int(-5), &mut reg);
        let int_id = reg.lookup(&TypeKey::Int).unwrap() as u8;
        // id width byte, id, tag (int, Byte width), value
        assert_eq!(bytes, vec![1, int_id, KIND_INT | (1 << 4), 0xFB]);
    }

    #[test]
    fn scalars_and_containers_round_trip() {
        let mut reg = TypeRegistry::new();
        let catalog = PipeCatalog::new();
        let config = CodecConfig::default();
        let values = vec![
            Value::Bool(true),
            Value::Int(i64::MIN),
            Value::UInt(70_000),
            Value::Float(-2.5),
            Value::Char('ß'),
            Value::Str("chunk".into()),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Enum {
                name: "Color".into(),
                ordinal: 300,
            },
            Value::List(vec![Value::Int(1), Value::Str("two".into()), Value::List(vec![])]),
        ];
        for value in values {
            let bytes = encode(&value, &mut reg);
            assert_eq!(decode(&bytes, &reg, &catalog, &config).unwrap(), value);
        }
    }

    #[test]
    fn structs_round_trip_through_catalog() {
        let mut reg = TypeRegistry::new();
        let mut catalog = PipeCatalog::new();
        catalog.register(point()).unwrap();
        let config = CodecConfig::default();

        let record = Record::new(point()).with("x", -40i64).unwrap();
        let value = Value::List(vec![Value::Record(record.clone()), Value::Record(record.with("label", "p").unwrap())]);
        let bytes = encode(&value, &mut reg);
        assert_eq!(decode(&bytes, &reg, &catalog, &config).unwrap(), value);
        assert!(reg
            .entry(reg.lookup(&TypeKey::struct_named("Point")).unwrap())
            .unwrap()
            .fingerprint
            .is_some());
    }

    #[test]
    fn enum_values_carry_their_name() {
        let mut reg = TypeRegistry::new();
        let color = EnumDef::new("Color", ["Red", "Green"]);
        let value = color.value("Green").unwrap();
        let bytes = encode(&value, &mut reg);
        let back = decode(&bytes, &reg, &PipeCatalog::new(), &CodecConfig::default()).unwrap();
        assert_eq!(back, value);
    }

    // -----------------------------------------------------------------------
    // Unknown types
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_id_fails_strict_and_skips_lenient() {
        let mut writer = TypeRegistry::new();
        let value = Value::List(vec![
            Value::Enum {
                name: "Gone".into(),
                ordinal: 1,
            },
            Value::Int(7),
        ]);
        let bytes = encode(&value, &mut writer);

        let reader = TypeRegistry::new();
        let catalog = PipeCatalog::new();
        let strict = decode(&bytes, &reader, &catalog, &CodecConfig::default()).unwrap_err();
        assert!(strict.is_recoverable());

        let lenient = CodecConfig {
            lenient_reads: true,
            ..CodecConfig::default()
        };
        let back = decode(&bytes, &reader, &catalog, &lenient).unwrap();
        let gone = writer.lookup(&TypeKey::enum_named("Gone")).unwrap();
        assert_eq!(back, Value::List(vec![Value::Unknown { type_id: gone }, Value::Int(7)]));
    }

    #[test]
    fn struct_without_schema_is_unknown_when_lenient() {
        let mut reg = TypeRegistry::new();
        let value = Value::Record(Record::new(point()));
        let bytes = encode(&value, &mut reg);
        let catalog = PipeCatalog::new();

        assert!(matches!(
            decode(&bytes, &reg, &catalog, &CodecConfig::default()),
            Err(CodecError::UnknownSchema(_))
        ));
        let lenient = CodecConfig {
            lenient_reads: true,
            ..CodecConfig::default()
        };
        assert!(matches!(
            decode(&bytes, &reg, &catalog, &lenient).unwrap(),
            Value::Unknown { .. }
        ));
    }

    #[test]
    fn skip_value_consumes_exactly_one_value() {
        let mut reg = TypeRegistry::new();
        let mut bytes = encode(&Value::Record(Record::new(point()).with("label", "x").unwrap()), &mut reg);
        bytes.extend(encode(&Value::Bool(false), &mut reg));
        let mut input = Cursor::new(bytes.as_slice());
        skip_value(&mut input).unwrap();
        skip_value(&mut input).unwrap();
        assert_eq!(input.position(), bytes.len() as u64);
    }

    #[test]
    fn mismatched_kind_is_rejected() {
        let mut reg = TypeRegistry::new();
        let mut bytes = encode(&Value::Int(1), &mut reg);
        let bool_id = reg.lookup(&TypeKey::Bool).unwrap() as u8;
        bytes[1] = bool_id;
        assert!(matches!(
            decode(&bytes, &reg, &PipeCatalog::new(), &CodecConfig::default()),
            Err(CodecError::InvalidValue(_))
        ));
    }

    #[test]
    fn unknown_values_cannot_be_written() {
        let mut reg = TypeRegistry::new();
        assert!(stage(&Value::Unknown { type_id: 3 }, &mut reg, true).is_err());
    }
}
