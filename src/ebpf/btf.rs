//! Runtime type description of probe event records
//!
//! A small, serializable subset of BTF: enough to locate members by byte
//! offset and to recognize the semantic types the decoder understands.
//! Bundles ship it as `types.json`; kernel-side enum tables are reached
//! through [`KernelTypes`].

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Upper bound on typedef indirection, guards against cyclic descriptions
const MAX_TYPEDEF_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Type {
    Int(Int),
    Typedef(Typedef),
    Struct(Struct),
    Enum(Enum),
    /// Pointers, arrays, unions: anything the decoder never interprets
    Opaque {
        #[serde(default)]
        name: String,
        size: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int {
    #[serde(default)]
    pub name: String,
    pub size: u32,
    #[serde(default)]
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typedef {
    pub name: String,
    #[serde(rename = "type")]
    pub target: Box<Type>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Struct {
    #[serde(default)]
    pub name: String,
    pub size: u32,
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Byte offset from the start of the enclosing struct
    pub offset: u32,
    #[serde(rename = "type")]
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enum {
    pub name: String,
    pub size: u32,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub values: Vec<EnumValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub name: String,
    /// Negative values are stored sign-extended to 64 bits
    #[serde(deserialize_with = "deserialize_enum_value")]
    pub value: u64,
}

fn deserialize_enum_value<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Unsigned(u64),
        Signed(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Unsigned(v) => v,
        Raw::Signed(v) => v as u64,
    })
}

impl Type {
    /// Declared name; empty for anonymous types
    pub fn name(&self) -> &str {
        match self {
            Type::Int(i) => &i.name,
            Type::Typedef(t) => &t.name,
            Type::Struct(s) => &s.name,
            Type::Enum(e) => &e.name,
            Type::Opaque { name, .. } => name,
        }
    }

    /// Follows typedefs down to the first non-alias type.
    ///
    /// Returns `None` when the chain is deeper than any sane description,
    /// which only happens with a cyclic or corrupted type description.
    pub fn resolve(&self) -> Option<&Type> {
        let mut current = self;
        for _ in 0..MAX_TYPEDEF_DEPTH {
            match current {
                Type::Typedef(t) => current = &t.target,
                other => return Some(other),
            }
        }
        None
    }

    /// Size in bytes, looking through typedefs
    pub fn size(&self) -> Option<u32> {
        match self.resolve()? {
            Type::Int(i) => Some(i.size),
            Type::Struct(s) => Some(s.size),
            Type::Enum(e) => Some(e.size),
            Type::Opaque { size, .. } => Some(*size),
            Type::Typedef(_) => None,
        }
    }
}

impl Struct {
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Named types shipped with a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCatalog {
    #[serde(default)]
    pub types: Vec<Type>,
}

impl TypeCatalog {
    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn find_struct(&self, name: &str) -> Option<&Struct> {
        self.types.iter().find_map(|t| match t {
            Type::Struct(s) if s.name == name => Some(s),
            _ => None,
        })
    }
}

/// Access to the running kernel's type information
pub trait KernelTypes: Send + Sync {
    /// Whether kernel type information could be loaded at all
    fn is_available(&self) -> bool {
        true
    }

    /// Looks up a kernel enum by name
    fn lookup_enum(&self, name: &str) -> Option<Enum>;
}

/// Kernel without usable type information
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKernelTypes;

impl KernelTypes for NoKernelTypes {
    fn is_available(&self) -> bool {
        false
    }

    fn lookup_enum(&self, _name: &str) -> Option<Enum> {
        None
    }
}

/// Fixed set of kernel enums, e.g. captured from another host
#[derive(Debug, Clone, Default)]
pub struct KernelEnumTable {
    enums: BTreeMap<String, Enum>,
}

impl KernelEnumTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, e: Enum) {
        self.enums.insert(e.name.clone(), e);
    }
}

impl KernelTypes for KernelEnumTable {
    fn lookup_enum(&self, name: &str) -> Option<Enum> {
        self.enums.get(name).cloned()
    }
}
