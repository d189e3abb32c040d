use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{CodecError, CodecResult};
use crate::field::IoField;
use crate::pipe::{PipeFlavor, StructPipe};
use crate::schema::{FieldType, Schema};
use crate::storable::Storable;
use crate::value::Value;

/// Schemas known by name, and the pipes compiled for them.
///
/// Each schema is compiled at most once per flavor; nested schemas are
/// compiled and cached on the way. A name is bound to one layout: registering
/// a different schema under a known name is a [`CodecError::SchemaConflict`].
#[derive(Debug, Default)]
pub struct PipeCatalog {
    schemas: HashMap<String, Arc<Schema>>,
    pipes: HashMap<(String, PipeFlavor), Arc<StructPipe>>,
}

impl PipeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `schema` and compile its contiguous pipe.
    pub fn register(&mut self, schema: Arc<Schema>) -> CodecResult<Arc<StructPipe>> {
        self.compile(&schema, PipeFlavor::Contiguous)
    }

    /// Register `schema` and compile its fixed-size pipe.
    pub fn register_fixed(&mut self, schema: Arc<Schema>) -> CodecResult<Arc<StructPipe>> {
        self.compile(&schema, PipeFlavor::Fixed)
    }

    pub fn pipe_for<T: Storable>(&mut self) -> CodecResult<Arc<StructPipe>> {
        self.register(T::schema())
    }

    /// The cached pipe for `schema` in `flavor`, compiling it if needed.
    pub fn compile(&mut self, schema: &Arc<Schema>, flavor: PipeFlavor) -> CodecResult<Arc<StructPipe>> {
        self.remember(schema)?;
        let key = (schema.name().to_string(), flavor);
        if let Some(pipe) = self.pipes.get(&key) {
            return Ok(pipe.clone());
        }

        let codecs = schema
            .fields()
            .iter()
            .map(|def| IoField::compile(schema.name(), def, flavor, self))
            .collect::<CodecResult<Vec<_>>>()?;
        let pipe = Arc::new(StructPipe::new(schema.clone(), flavor, codecs));
        debug!(
            schema = schema.name(),
            ?flavor,
            bits = pipe.merger().total_bits(),
            fixed_size = ?pipe.fixed_size(),
            "compiled struct pipe"
        );
        self.pipes.insert(key, pipe.clone());
        Ok(pipe)
    }

    fn remember(&mut self, schema: &Arc<Schema>) -> CodecResult<()> {
        match self.schemas.get(schema.name()) {
            Some(known) if known.fingerprint() != schema.fingerprint() => {
                Err(CodecError::SchemaConflict(schema.name().to_string()))
            }
            Some(_) => Ok(()),
            None => {
                self.schemas.insert(schema.name().to_string(), schema.clone());
                for field in schema.fields() {
                    self.remember_type(&field.ty)?;
                }
                Ok(())
            }
        }
    }

    fn remember_type(&mut self, ty: &FieldType) -> CodecResult<()> {
        match ty {
            FieldType::Struct(s) | FieldType::StructRef(s) => self.remember(s),
            FieldType::Sealed(variants) => variants.iter().try_for_each(|s| self.remember(s)),
            FieldType::List(elem) => self.remember_type(elem),
            FieldType::FixedArray { elem, .. } => self.remember_type(elem),
            _ => Ok(()),
        }
    }

    /// Remember the schema of every record inside `value`, so dynamic
    /// reads can resolve them.
    pub fn remember_value(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Record(record) => {
                self.remember(record.schema())?;
                record
                    .values()
                    .iter()
                    .flatten()
                    .try_for_each(|v| self.remember_value(v))
            }
            Value::List(items) => items.iter().try_for_each(|v| self.remember_value(v)),
            _ => Ok(()),
        }
    }

    pub fn schema(&self, name: &str) -> Option<&Arc<Schema>> {
        self.schemas.get(name)
    }

    pub fn pipe(&self, name: &str, flavor: PipeFlavor) -> Option<Arc<StructPipe>> {
        self.pipes.get(&(name.to_string(), flavor)).cloned()
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Arc<Schema>> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;

    fn point() -> Arc<Schema> {
        Schema::builder("Point")
            .field("x", FieldType::I32)
            .field("y", FieldType::I32)
            .build()
    }

    #[test]
    fn pipes_are_cached_per_flavor() {
        let mut c = PipeCatalog::new();
        let a = c.register(point()).unwrap();
        let b = c.register(point()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let f = c.register_fixed(point()).unwrap();
        assert!(!Arc::ptr_eq(&a, &f));
        assert!(c.pipe("Point", PipeFlavor::Fixed).is_some());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn nested_schemas_are_remembered() {
        let mut c = PipeCatalog::new();
        let line = Schema::builder("Line")
            .field("points", FieldType::list(FieldType::StructRef(point())))
            .build();
        assert!(c.register(line).is_err());

        let line = Schema::builder("Line")
            .field("from", FieldType::Struct(point()))
            .field("to", FieldType::StructRef(point()))
            .build();
        c.register(line).unwrap();
        assert!(c.schema("Point").is_some());
        assert!(c.pipe("Point", PipeFlavor::Contiguous).is_some());
    }

    #[test]
    fn same_name_different_layout_conflicts() {
        let mut c = PipeCatalog::new();
        c.register(point()).unwrap();
        let other = Schema::builder("Point").field("x", FieldType::I64).build();
        assert!(matches!(c.register(other), Err(CodecError::SchemaConflict(name)) if name == "Point"));
    }

    #[test]
    fn remember_value_walks_records() {
        let mut c = PipeCatalog::new();
        let holder = Schema::builder("Holder").field("any", FieldType::Dynamic).build();
        let inner = Value::Record(Record::new(point()));
        let r = Record::new(holder).with("any", Value::List(vec![inner])).unwrap();
        c.remember_value(&Value::Record(r)).unwrap();
        assert!(c.schema("Holder").is_some());
        assert!(c.schema("Point").is_some());
    }
}
