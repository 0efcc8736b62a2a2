//! Dynamically typed property values.
//!
//! [`Variant`] is the value type stored in every property bag. It covers the
//! value kinds the export envelopes know how to encode, plus an opaque
//! escape hatch for arbitrary `Send + Sync` payloads that are never exported.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Rendering used for values that cannot be serialized.
pub const NON_EXPORTABLE_RENDERING: &str = "Non-exportable variant";

/// An opaque, type-erased value.
///
/// Two opaque values are equal only when they share the same allocation.
#[derive(Clone)]
pub struct OpaqueValue {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl OpaqueValue {
    /// Wrap a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    /// The Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the wrapped value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// A dynamically typed value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Variant {
    /// No value.
    #[default]
    Invalid,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    StringList(Vec<String>),
    Bytes(Vec<u8>),
    /// A value that is carried around but never exported.
    Opaque(OpaqueValue),
}

impl Variant {
    /// Wrap an arbitrary value as [`Variant::Opaque`].
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(OpaqueValue::new(value))
    }

    /// Returns `false` for [`Variant::Invalid`].
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid)
    }

    /// Whether the value can be written to an export envelope.
    pub fn is_exportable(&self) -> bool {
        !matches!(self, Self::Opaque(_))
    }

    /// Short type name used in XML envelopes and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::UInt(_) => "UInt",
            Self::Double(_) => "Double",
            Self::String(_) => "String",
            Self::StringList(_) => "StringList",
            Self::Bytes(_) => "Bytes",
            Self::Opaque(_) => "Opaque",
        }
    }

    pub fn to_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::UInt(u) => Some(*u != 0),
            Self::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn to_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn to_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(u) => Some(*u),
            Self::Int(i) => u64::try_from(*i).ok(),
            Self::Bool(b) => Some(u64::from(*b)),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn to_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Borrow a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow a string list value.
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(list) => Some(list),
            _ => None,
        }
    }

    /// Render the value as text.
    ///
    /// String lists are comma-joined, byte arrays are base64 encoded and
    /// opaque values render as [`NON_EXPORTABLE_RENDERING`].
    pub fn render(&self) -> String {
        match self {
            Self::Invalid => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::UInt(u) => u.to_string(),
            Self::Double(d) => d.to_string(),
            Self::String(s) => s.clone(),
            Self::StringList(list) => list.join(","),
            Self::Bytes(bytes) => BASE64.encode(bytes),
            Self::Opaque(_) => NON_EXPORTABLE_RENDERING.to_string(),
        }
    }

    /// Parse a value previously produced by [`Variant::render`].
    ///
    /// Returns `None` if the type name is unknown, names a non-exportable
    /// type, or the text cannot be parsed as that type.
    pub fn from_rendered(type_name: &str, text: &str) -> Option<Self> {
        let value = match type_name {
            "Invalid" => Self::Invalid,
            "Bool" => Self::Bool(text.parse().ok()?),
            "Int" => Self::Int(text.parse().ok()?),
            "UInt" => Self::UInt(text.parse().ok()?),
            "Double" => Self::Double(text.parse().ok()?),
            "String" => Self::String(text.to_string()),
            "StringList" => {
                if text.is_empty() {
                    Self::StringList(Vec::new())
                } else {
                    Self::StringList(text.split(',').map(str::to_string).collect())
                }
            }
            "Bytes" => Self::Bytes(BASE64.decode(text).ok()?),
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Variant {
    fn from(value: u32) -> Self {
        Self::UInt(u64::from(value))
    }
}

impl From<u64> for Variant {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<String>> for Variant {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}
