use std::sync::Arc;

use crate::error::{CodecError, CodecResult};
use crate::schema::{Nullability, Schema};

/// A decoded or to-be-encoded field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    Enum { name: String, ordinal: u32 },
    Record(Record),
    List(Vec<Value>),
    /// A dynamic value whose type id is not known to the reader. Only
    /// produced by lenient reads; it can never be stored.
    Unknown { type_id: u32 },
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Char(_) => "char",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Enum { .. } => "enum",
            Self::Record(_) => "record",
            Self::List(_) => "list",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// `true` unless the value is, or contains, [`Value::Unknown`].
    pub fn is_dynamic_storable(&self) -> bool {
        match self {
            Self::Unknown { .. } => false,
            Self::List(items) => items.iter().all(Value::is_dynamic_storable),
            Self::Record(record) => record
                .values()
                .iter()
                .flatten()
                .all(Value::is_dynamic_storable),
            _ => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::UInt(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Self::Char(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Self::Record(v)
    }
}

/// Field values of one struct instance, in schema order.
///
/// Assignment enforces nullability and type: a `NotNull` field can never be
/// left empty and a `DefaultIfNull` field receives its default instead of
/// being emptied.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Option<Value>>,
}

impl Record {
    /// A record with every non-nullable field at its default and every
    /// nullable field null.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = schema
            .fields()
            .iter()
            .map(|f| match f.nullability {
                Nullability::Nullable => None,
                Nullability::NotNull | Nullability::DefaultIfNull => Some(f.ty.default_value()),
            })
            .collect();
        Self { schema, values }
    }

    /// Assemble a record from already validated values.
    pub(crate) fn from_values(schema: Arc<Schema>, values: Vec<Option<Value>>) -> Self {
        debug_assert_eq!(schema.fields().len(), values.len());
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    fn index(&self, field: &str) -> CodecResult<usize> {
        self.schema
            .index_of(field)
            .ok_or_else(|| CodecError::UnknownField {
                schema: self.schema.name().to_string(),
                field: field.to_string(),
            })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.schema
            .index_of(field)
            .and_then(|i| self.values[i].as_ref())
    }

    /// Like [`get`](Self::get) but an absent value is an error.
    pub fn require(&self, field: &str) -> CodecResult<&Value> {
        let i = self.index(field)?;
        self.values[i].as_ref().ok_or_else(|| CodecError::NullViolation {
            schema: self.schema.name().to_string(),
            field: field.to_string(),
        })
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> CodecResult<()> {
        self.set_opt(field, Some(value.into()))
    }

    /// Assign or clear a field.
    pub fn set_opt(&mut self, field: &str, value: Option<Value>) -> CodecResult<()> {
        let i = self.index(field)?;
        let def = &self.schema.fields()[i];
        let value = match value {
            Some(v) => {
                if !def.ty.accepts(&v) {
                    return Err(CodecError::TypeMismatch {
                        field: def.name.clone(),
                        expected: def.ty.describe(),
                        actual: v.kind_name().to_string(),
                    });
                }
                Some(v)
            }
            None => match def.nullability {
                Nullability::Nullable => None,
                Nullability::DefaultIfNull => Some(def.ty.default_value()),
                Nullability::NotNull => {
                    return Err(CodecError::NullViolation {
                        schema: self.schema.name().to_string(),
                        field: def.name.clone(),
                    })
                }
            },
        };
        self.values[i] = value;
        Ok(())
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> CodecResult<Self> {
        self.set(field, value)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EnumDef, FieldType};

    fn tagged() -> Arc<Schema> {
        Schema::builder("Tagged")
            .field("id", FieldType::U32)
            .nullable("label", FieldType::Str)
            .default_if_null("tags", FieldType::list(FieldType::Str))
            .build()
    }

    #[test]
    fn new_record_fills_defaults() {
        let r = Record::new(tagged());
        assert_eq!(r.get("id"), Some(&Value::UInt(0)));
        assert_eq!(r.get("label"), None);
        assert_eq!(r.get("tags"), Some(&Value::List(vec![])));
    }

    #[test]
    fn not_null_rejects_absence_at_assignment() {
        let mut r = Record::new(tagged());
        let err = r.set_opt("id", None).unwrap_err();
        assert!(matches!(err, CodecError::NullViolation { ref field, .. } if field == "id"));
    }

    #[test]
    fn default_if_null_substitutes_default() {
        let mut r = Record::new(tagged());
        r.set("tags", Value::List(vec!["a".into()])).unwrap();
        r.set_opt("tags", None).unwrap();
        assert_eq!(r.get("tags"), Some(&Value::List(vec![])));
    }

    #[test]
    fn nullable_accepts_absence() {
        let mut r = Record::new(tagged()).with("label", "x").unwrap();
        assert_eq!(r.get("label").and_then(Value::as_str), Some("x"));
        r.set_opt("label", None).unwrap();
        assert!(r.get("label").is_none());
        assert!(matches!(r.require("label"), Err(CodecError::NullViolation { .. })));
    }

    #[test]
    fn set_checks_type() {
        let mut r = Record::new(tagged());
        assert!(matches!(
            r.set("id", Value::Int(3)),
            Err(CodecError::TypeMismatch { .. })
        ));
        assert!(matches!(
            r.set("id", Value::UInt(u64::from(u32::MAX) + 1)),
            Err(CodecError::TypeMismatch { .. })
        ));
        assert!(matches!(
            r.set("missing", 1i64),
            Err(CodecError::UnknownField { .. })
        ));
    }

    #[test]
    fn unknown_values_are_not_storable() {
        let s = Schema::builder("Holder").field("any", FieldType::Dynamic).build();
        let mut r = Record::new(s);
        assert!(r.set("any", Value::Unknown { type_id: 99 }).is_err());
        assert!(r
            .set("any", Value::List(vec![Value::Unknown { type_id: 1 }]))
            .is_err());
        r.set("any", EnumDef::new("E", ["A"]).value("A").unwrap()).unwrap();
    }
}
