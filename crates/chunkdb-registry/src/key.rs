use std::fmt;

use serde::{Deserialize, Serialize};

/// What a registry id stands for.
///
/// Builtin kinds are the value shapes the self-describing value codec knows
/// natively; they sit at fixed ids below [`TypeKey::FIRST_USER_ID`] in every
/// registry. Structs and enums are registered by name on first use.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeKey {
    Bool,
    Int,
    UInt,
    Float,
    Char,
    Str,
    Bytes,
    List,
    Struct(String),
    Enum(String),
}

impl TypeKey {
    /// Builtins in id order.
    pub const BUILTINS: [TypeKey; 8] = [
        TypeKey::Bool,
        TypeKey::Int,
        TypeKey::UInt,
        TypeKey::Float,
        TypeKey::Char,
        TypeKey::Str,
        TypeKey::Bytes,
        TypeKey::List,
    ];

    /// Ids below this are reserved for builtins.
    pub const FIRST_USER_ID: u32 = 16;

    pub fn struct_named(name: impl Into<String>) -> Self {
        Self::Struct(name.into())
    }

    pub fn enum_named(name: impl Into<String>) -> Self {
        Self::Enum(name.into())
    }

    /// Fixed id of a builtin kind.
    pub fn builtin_id(&self) -> Option<u32> {
        Self::BUILTINS
            .iter()
            .position(|b| b == self)
            .map(|i| i as u32)
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin_id().is_some()
    }

    /// Name of a struct or enum key.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Struct(name) | Self::Enum(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::UInt => f.write_str("uint"),
            Self::Float => f.write_str("float"),
            Self::Char => f.write_str("char"),
            Self::Str => f.write_str("str"),
            Self::Bytes => f.write_str("bytes"),
            Self::List => f.write_str("list"),
            Self::Struct(name) => write!(f, "struct {name}"),
            Self::Enum(name) => write!(f, "enum {name}"),
        }
    }
}
