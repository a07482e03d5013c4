use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reference to a host object living in a context's object table.
///
/// The handle never owns the object; resolving it back goes through the
/// table, so a handle outliving its entry resolves to `UnknownObject`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectHandle {
    pub id: u64,
    pub type_tag: String,
}

/// A structured record: type id plus fields in declaration order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructValue {
    pub type_id: String,
    pub fields: Vec<(String, TypedValue)>,
}

impl StructValue {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: TypedValue) -> Self {
        self.push(name, value);
        self
    }

    /// Appends a field, replacing an existing one with the same name in place.
    pub fn push(&mut self, name: impl Into<String>, value: TypedValue) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(key, _)| *key == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&TypedValue> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// Logical value model for everything that crosses the bridge.
///
/// The tree owns its children, so it is always finite and acyclic. Object
/// graphs travel as [`ObjectHandle`]s instead of being inlined.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum TypedValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Object(ObjectHandle),
    Struct(StructValue),
    Array(Vec<TypedValue>),
    Map(BTreeMap<String, TypedValue>),
}

impl TypedValue {
    /// Short tag name used in diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            TypedValue::Null => "null",
            TypedValue::Bool(_) => "bool",
            TypedValue::Int(_) => "int",
            TypedValue::Float(_) => "float",
            TypedValue::String(_) => "string",
            TypedValue::Object(_) => "object",
            TypedValue::Struct(_) => "struct",
            TypedValue::Array(_) => "array",
            TypedValue::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TypedValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Int(value) => Some(*value as f64),
            TypedValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Null => f.write_str("null"),
            TypedValue::Bool(value) => write!(f, "{value}"),
            TypedValue::Int(value) => write!(f, "{value}"),
            TypedValue::Float(value) => write!(f, "{value}"),
            TypedValue::String(value) => f.write_str(value),
            TypedValue::Object(handle) => write!(f, "[{} #{}]", handle.type_tag, handle.id),
            TypedValue::Struct(record) => write!(f, "[struct {}]", record.type_id),
            TypedValue::Array(items) => write!(f, "[array of {}]", items.len()),
            TypedValue::Map(entries) => write!(f, "[map of {}]", entries.len()),
        }
    }
}

impl From<bool> for TypedValue {
    fn from(value: bool) -> Self {
        TypedValue::Bool(value)
    }
}

impl From<i32> for TypedValue {
    fn from(value: i32) -> Self {
        TypedValue::Int(value.into())
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        TypedValue::Int(value)
    }
}

impl From<f64> for TypedValue {
    fn from(value: f64) -> Self {
        TypedValue::Float(value)
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::String(value.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(value: String) -> Self {
        TypedValue::String(value)
    }
}

impl From<ObjectHandle> for TypedValue {
    fn from(value: ObjectHandle) -> Self {
        TypedValue::Object(value)
    }
}

impl From<StructValue> for TypedValue {
    fn from(value: StructValue) -> Self {
        TypedValue::Struct(value)
    }
}

impl From<Vec<TypedValue>> for TypedValue {
    fn from(value: Vec<TypedValue>) -> Self {
        TypedValue::Array(value)
    }
}
