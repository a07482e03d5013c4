//! Conversion between native Rust values and [`TypedValue`] trees.
//!
//! Encoding is total for the supported set of native types. Decoding is
//! partial and reports a [`CodecError`] when the wire tag does not fit the
//! expected type. Struct decoding ignores unknown fields and defaults missing
//! `Option` fields to `None`.
//!
//! Integers travel as `Int`; a `Float` is accepted where an integer is
//! expected only if it is integral and within +/-2^53, the range a 64-bit
//! float represents exactly. `u64` values above `i64::MAX` are encoded as
//! `Float` and lose precision past 2^53.

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

use thiserror::Error;

use crate::bridge::callback::ScriptFunction;
use crate::bridge::context::ScriptingContext;
use crate::value::{ObjectHandle, StructValue, TypedValue};

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{value} does not fit in {expected}")]
    OutOfRange {
        expected: &'static str,
        value: String,
    },
    #[error("{type_id} is missing field '{field}'")]
    MissingField {
        type_id: &'static str,
        field: &'static str,
    },
    #[error("'{value}' is not a variant of {type_id}")]
    UnknownVariant {
        type_id: &'static str,
        value: String,
    },
    #[error("{field}: {error}")]
    Field {
        field: String,
        error: Box<CodecError>,
    },
}

impl CodecError {
    fn mismatch(expected: &'static str, value: &TypedValue) -> Self {
        CodecError::TypeMismatch {
            expected,
            found: value.tag(),
        }
    }

    fn in_field(self, field: impl Into<String>) -> Self {
        CodecError::Field {
            field: field.into(),
            error: Box::new(self),
        }
    }
}

/// Coarse wire-level shape a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Any,
    Bool,
    Int,
    Float,
    String,
    Object,
    Struct,
    Array,
    Map,
    /// A script function, carried as its callback id string.
    Function,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Any => "any",
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::String => "string",
            ParamKind::Object => "object",
            ParamKind::Struct => "struct",
            ParamKind::Array => "array",
            ParamKind::Map => "map",
            ParamKind::Function => "function",
        }
    }

    pub fn accepts(self, value: &TypedValue) -> bool {
        match (self, value) {
            (ParamKind::Any, _) => true,
            (ParamKind::Bool, TypedValue::Bool(_)) => true,
            (ParamKind::Int, TypedValue::Int(_)) => true,
            (ParamKind::Int, TypedValue::Float(float)) => float_as_int(*float).is_some(),
            (ParamKind::Float, TypedValue::Int(_) | TypedValue::Float(_)) => true,
            (ParamKind::String | ParamKind::Function, TypedValue::String(_)) => true,
            (ParamKind::Object, TypedValue::Object(_) | TypedValue::Null) => true,
            (ParamKind::Struct, TypedValue::Struct(_) | TypedValue::Map(_)) => true,
            (ParamKind::Array, TypedValue::Array(_)) => true,
            (ParamKind::Map, TypedValue::Map(_) | TypedValue::Struct(_)) => true,
            _ => false,
        }
    }
}

/// Declared shape of one method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub nullable: bool,
}

impl ParamSpec {
    pub const fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            nullable: false,
        }
    }

    pub const fn of<T: BridgeDecode>() -> Self {
        Self {
            kind: T::KIND,
            nullable: T::NULLABLE,
        }
    }

    pub fn accepts(&self, value: &TypedValue) -> bool {
        (self.nullable && value.is_null()) || self.kind.accepts(value)
    }
}

/// Context threaded through nested decodes.
///
/// Carries the owning scripting context so decoded [`ScriptFunction`]s are
/// bound to it. A detached scope yields functions whose calls do nothing.
#[derive(Clone, Default)]
pub struct DecodeScope {
    owner: Weak<ScriptingContext>,
}

impl DecodeScope {
    pub fn detached() -> Self {
        Self::default()
    }

    pub(crate) fn for_context(owner: Weak<ScriptingContext>) -> Self {
        Self { owner }
    }

    pub(crate) fn owner(&self) -> &Weak<ScriptingContext> {
        &self.owner
    }
}

pub trait BridgeEncode {
    fn encode(&self) -> TypedValue;
}

pub trait BridgeDecode: Sized {
    const KIND: ParamKind;
    const NULLABLE: bool = false;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError>;

    fn decode(value: &TypedValue) -> Result<Self, CodecError> {
        Self::decode_in(value, &DecodeScope::detached())
    }

    /// Value used when a struct field is absent. `None` makes the field required.
    fn missing() -> Option<Self> {
        None
    }
}

pub fn encode<T: BridgeEncode + ?Sized>(value: &T) -> TypedValue {
    value.encode()
}

pub fn decode<T: BridgeDecode>(value: &TypedValue) -> Result<T, CodecError> {
    T::decode(value)
}

fn float_as_int(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        Some(value as i64)
    } else {
        None
    }
}

fn decode_i64(value: &TypedValue, expected: &'static str) -> Result<i64, CodecError> {
    match value {
        TypedValue::Int(int) => Ok(*int),
        TypedValue::Float(float) => float_as_int(*float).ok_or_else(|| CodecError::OutOfRange {
            expected,
            value: float.to_string(),
        }),
        other => Err(CodecError::mismatch(expected, other)),
    }
}

impl<T: BridgeEncode + ?Sized> BridgeEncode for &T {
    fn encode(&self) -> TypedValue {
        (**self).encode()
    }
}

impl BridgeEncode for TypedValue {
    fn encode(&self) -> TypedValue {
        self.clone()
    }
}

impl BridgeDecode for TypedValue {
    const KIND: ParamKind = ParamKind::Any;
    const NULLABLE: bool = true;

    fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
        Ok(value.clone())
    }
}

impl BridgeEncode for bool {
    fn encode(&self) -> TypedValue {
        TypedValue::Bool(*self)
    }
}

impl BridgeDecode for bool {
    const KIND: ParamKind = ParamKind::Bool;

    fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
        value.as_bool().ok_or_else(|| CodecError::mismatch("bool", value))
    }
}

macro_rules! signed_codec {
    ($($ty:ty),*) => {
        $(
            impl BridgeEncode for $ty {
                fn encode(&self) -> TypedValue {
                    TypedValue::Int(*self as i64)
                }
            }

            impl BridgeDecode for $ty {
                const KIND: ParamKind = ParamKind::Int;

                fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
                    let wide = decode_i64(value, stringify!($ty))?;
                    <$ty>::try_from(wide).map_err(|_| CodecError::OutOfRange {
                        expected: stringify!($ty),
                        value: wide.to_string(),
                    })
                }
            }
        )*
    };
}

signed_codec!(i8, i16, i32, i64, isize);

macro_rules! narrow_unsigned_codec {
    ($($ty:ty),*) => {
        $(
            impl BridgeEncode for $ty {
                fn encode(&self) -> TypedValue {
                    TypedValue::Int(i64::from(*self))
                }
            }

            impl BridgeDecode for $ty {
                const KIND: ParamKind = ParamKind::Int;

                fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
                    let wide = decode_i64(value, stringify!($ty))?;
                    <$ty>::try_from(wide).map_err(|_| CodecError::OutOfRange {
                        expected: stringify!($ty),
                        value: wide.to_string(),
                    })
                }
            }
        )*
    };
}

narrow_unsigned_codec!(u8, u16, u32);

impl BridgeEncode for u64 {
    fn encode(&self) -> TypedValue {
        match i64::try_from(*self) {
            Ok(int) => TypedValue::Int(int),
            Err(_) => TypedValue::Float(*self as f64),
        }
    }
}

impl BridgeDecode for u64 {
    const KIND: ParamKind = ParamKind::Int;

    fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
        let out_of_range = |text: String| CodecError::OutOfRange {
            expected: "u64",
            value: text,
        };
        match value {
            TypedValue::Int(int) => u64::try_from(*int).map_err(|_| out_of_range(int.to_string())),
            // 2^64 itself is what u64::MAX rounds to.
            TypedValue::Float(float)
                if float.is_finite()
                    && float.fract() == 0.0
                    && *float >= 0.0
                    && *float <= 18_446_744_073_709_551_616.0 =>
            {
                Ok(*float as u64)
            }
            TypedValue::Float(float) => Err(out_of_range(float.to_string())),
            other => Err(CodecError::mismatch("u64", other)),
        }
    }
}

impl BridgeEncode for usize {
    fn encode(&self) -> TypedValue {
        (*self as u64).encode()
    }
}

impl BridgeDecode for usize {
    const KIND: ParamKind = ParamKind::Int;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError> {
        let wide = u64::decode_in(value, scope)?;
        usize::try_from(wide).map_err(|_| CodecError::OutOfRange {
            expected: "usize",
            value: wide.to_string(),
        })
    }
}

impl BridgeEncode for f64 {
    fn encode(&self) -> TypedValue {
        TypedValue::Float(*self)
    }
}

impl BridgeDecode for f64 {
    const KIND: ParamKind = ParamKind::Float;

    fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
        value.as_f64().ok_or_else(|| CodecError::mismatch("float", value))
    }
}

impl BridgeEncode for f32 {
    fn encode(&self) -> TypedValue {
        TypedValue::Float(f64::from(*self))
    }
}

impl BridgeDecode for f32 {
    const KIND: ParamKind = ParamKind::Float;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError> {
        f64::decode_in(value, scope).map(|wide| wide as f32)
    }
}

impl BridgeEncode for str {
    fn encode(&self) -> TypedValue {
        TypedValue::String(self.to_string())
    }
}

impl BridgeEncode for String {
    fn encode(&self) -> TypedValue {
        TypedValue::String(self.clone())
    }
}

impl BridgeDecode for String {
    const KIND: ParamKind = ParamKind::String;

    fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CodecError::mismatch("string", value))
    }
}

impl<T: BridgeEncode> BridgeEncode for Option<T> {
    fn encode(&self) -> TypedValue {
        match self {
            Some(inner) => inner.encode(),
            None => TypedValue::Null,
        }
    }
}

impl<T: BridgeDecode> BridgeDecode for Option<T> {
    const KIND: ParamKind = T::KIND;
    const NULLABLE: bool = true;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError> {
        if value.is_null() {
            return Ok(None);
        }
        T::decode_in(value, scope).map(Some)
    }

    fn missing() -> Option<Self> {
        Some(None)
    }
}

impl<T: BridgeEncode> BridgeEncode for [T] {
    fn encode(&self) -> TypedValue {
        TypedValue::Array(self.iter().map(BridgeEncode::encode).collect())
    }
}

impl<T: BridgeEncode> BridgeEncode for Vec<T> {
    fn encode(&self) -> TypedValue {
        self.as_slice().encode()
    }
}

impl<T: BridgeDecode> BridgeDecode for Vec<T> {
    const KIND: ParamKind = ParamKind::Array;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError> {
        let TypedValue::Array(items) = value else {
            return Err(CodecError::mismatch("array", value));
        };
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                T::decode_in(item, scope).map_err(|err| err.in_field(format!("[{index}]")))
            })
            .collect()
    }
}

fn map_entries<'a>(
    value: &'a TypedValue,
) -> Result<Box<dyn Iterator<Item = (&'a String, &'a TypedValue)> + 'a>, CodecError> {
    match value {
        TypedValue::Map(entries) => Ok(Box::new(entries.iter())),
        TypedValue::Struct(record) => Ok(Box::new(
            record.fields.iter().map(|(key, field)| (key, field)),
        )),
        other => Err(CodecError::mismatch("map", other)),
    }
}

impl<T: BridgeEncode> BridgeEncode for BTreeMap<String, T> {
    fn encode(&self) -> TypedValue {
        TypedValue::Map(
            self.iter()
                .map(|(key, value)| (key.clone(), value.encode()))
                .collect(),
        )
    }
}

impl<T: BridgeDecode> BridgeDecode for BTreeMap<String, T> {
    const KIND: ParamKind = ParamKind::Map;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError> {
        map_entries(value)?
            .map(|(key, item)| {
                T::decode_in(item, scope)
                    .map(|decoded| (key.clone(), decoded))
                    .map_err(|err| err.in_field(key.clone()))
            })
            .collect()
    }
}

impl<T: BridgeEncode, S> BridgeEncode for HashMap<String, T, S> {
    fn encode(&self) -> TypedValue {
        TypedValue::Map(
            self.iter()
                .map(|(key, value)| (key.clone(), value.encode()))
                .collect(),
        )
    }
}

impl<T: BridgeDecode> BridgeDecode for HashMap<String, T> {
    const KIND: ParamKind = ParamKind::Map;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError> {
        map_entries(value)?
            .map(|(key, item)| {
                T::decode_in(item, scope)
                    .map(|decoded| (key.clone(), decoded))
                    .map_err(|err| err.in_field(key.clone()))
            })
            .collect()
    }
}

impl BridgeEncode for ObjectHandle {
    fn encode(&self) -> TypedValue {
        TypedValue::Object(self.clone())
    }
}

impl BridgeDecode for ObjectHandle {
    const KIND: ParamKind = ParamKind::Object;

    fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
        match value {
            TypedValue::Object(handle) => Ok(handle.clone()),
            other => Err(CodecError::mismatch("object", other)),
        }
    }
}

impl BridgeEncode for StructValue {
    fn encode(&self) -> TypedValue {
        TypedValue::Struct(self.clone())
    }
}

impl BridgeDecode for StructValue {
    const KIND: ParamKind = ParamKind::Struct;

    fn decode_in(value: &TypedValue, _scope: &DecodeScope) -> Result<Self, CodecError> {
        match value {
            TypedValue::Struct(record) => Ok(record.clone()),
            TypedValue::Map(entries) => Ok(StructValue {
                type_id: String::new(),
                fields: entries
                    .iter()
                    .map(|(key, field)| (key.clone(), field.clone()))
                    .collect(),
            }),
            other => Err(CodecError::mismatch("struct", other)),
        }
    }
}

impl BridgeEncode for ScriptFunction {
    fn encode(&self) -> TypedValue {
        TypedValue::String(self.id().to_string())
    }
}

impl BridgeDecode for ScriptFunction {
    const KIND: ParamKind = ParamKind::Function;

    fn decode_in(value: &TypedValue, scope: &DecodeScope) -> Result<Self, CodecError> {
        let text = value
            .as_str()
            .ok_or_else(|| CodecError::mismatch("function", value))?;
        let id = text.parse().map_err(|_| CodecError::OutOfRange {
            expected: "callback id",
            value: text.to_string(),
        })?;
        Ok(ScriptFunction::new(id, scope.owner().clone()))
    }
}

/// Field access for generated struct decoders. Accepts both `Struct` and
/// `Map` values since scripts cannot name struct types.
#[doc(hidden)]
pub struct StructFields<'a> {
    type_id: &'static str,
    value: &'a TypedValue,
}

impl<'a> StructFields<'a> {
    pub fn new(type_id: &'static str, value: &'a TypedValue) -> Result<Self, CodecError> {
        match value {
            TypedValue::Struct(_) | TypedValue::Map(_) => Ok(Self { type_id, value }),
            other => Err(CodecError::mismatch("struct", other)),
        }
    }

    fn get(&self, name: &str) -> Option<&'a TypedValue> {
        match self.value {
            TypedValue::Struct(record) => record.get(name),
            TypedValue::Map(entries) => entries.get(name),
            _ => None,
        }
    }

    pub fn field<T: BridgeDecode>(
        &self,
        name: &'static str,
        scope: &DecodeScope,
    ) -> Result<T, CodecError> {
        match self.get(name) {
            Some(value) => T::decode_in(value, scope).map_err(|err| err.in_field(name)),
            None => T::missing().ok_or(CodecError::MissingField {
                type_id: self.type_id,
                field: name,
            }),
        }
    }
}

/// Declares a struct together with its bridge encoder and decoder.
///
/// ```
/// pagebridge::bridge_struct! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Point {
///         pub x: f64,
///         pub y: f64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! bridge_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field : $fty ),*
        }

        impl $crate::codec::BridgeEncode for $name {
            fn encode(&self) -> $crate::value::TypedValue {
                let mut record = $crate::value::StructValue::new(stringify!($name));
                $(
                    record.push(
                        stringify!($field),
                        $crate::codec::BridgeEncode::encode(&self.$field),
                    );
                )*
                $crate::value::TypedValue::Struct(record)
            }
        }

        impl $crate::codec::BridgeDecode for $name {
            const KIND: $crate::codec::ParamKind = $crate::codec::ParamKind::Struct;

            fn decode_in(
                value: &$crate::value::TypedValue,
                scope: &$crate::codec::DecodeScope,
            ) -> ::std::result::Result<Self, $crate::codec::CodecError> {
                let _fields = $crate::codec::StructFields::new(stringify!($name), value)?;
                let _ = scope;
                Ok(Self {
                    $( $field: _fields.field(stringify!($field), scope)?, )*
                })
            }
        }
    };
}

/// Declares a fieldless enum that travels as its variant name.
#[macro_export]
macro_rules! bridge_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),*
        }

        impl $crate::codec::BridgeEncode for $name {
            fn encode(&self) -> $crate::value::TypedValue {
                let name = match self {
                    $( $name::$variant => stringify!($variant), )*
                };
                $crate::value::TypedValue::String(name.to_string())
            }
        }

        impl $crate::codec::BridgeDecode for $name {
            const KIND: $crate::codec::ParamKind = $crate::codec::ParamKind::String;

            fn decode_in(
                value: &$crate::value::TypedValue,
                _scope: &$crate::codec::DecodeScope,
            ) -> ::std::result::Result<Self, $crate::codec::CodecError> {
                let text = value.as_str().ok_or($crate::codec::CodecError::TypeMismatch {
                    expected: "string",
                    found: value.tag(),
                })?;
                $(
                    if text.eq_ignore_ascii_case(stringify!($variant)) {
                        return Ok($name::$variant);
                    }
                )*
                Err($crate::codec::CodecError::UnknownVariant {
                    type_id: stringify!($name),
                    value: text.to_string(),
                })
            }
        }
    };
}
