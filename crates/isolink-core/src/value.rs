//! Value model exchanged over a channel
//!
//! `Value` is a closed, self-describing tagged union. Primitive variants are
//! owned by value; `Handle` and `Buffer` refer to resources owned outside the
//! value itself and travel in the codec's side table rather than in the byte
//! stream.

use crate::handle::HandleRef;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A value that can be sent across a channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absence of a value
    Null,

    /// Boolean value
    Bool(bool),

    /// 64-bit signed integer
    I64(i64),

    /// 64-bit floating point number
    F64(f64),

    /// UTF-8 string
    String(String),

    /// Raw byte sequence, copied into the message
    Bytes(Vec<u8>),

    /// Ordered list of values
    List(Vec<Value>),

    /// Insertion-ordered map, looked up by key equality
    Map(ValueMap),

    /// Reference to a native resource with a finalizer-aware proxy
    Handle(HandleRef),

    /// Reference to a shared native byte buffer, passed without copying
    Buffer(BufferRef),
}

impl Value {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Handle(_) => "handle",
            Value::Buffer(_) => "buffer",
        }
    }

    /// Borrow the string payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer payload, if any
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow the list payload, if any
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the map payload, if any
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I64(i) => write!(f, "{}", i),
            Value::F64(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Handle(handle) => write!(f, "Handle({})", handle.id()),
            Value::Buffer(buffer) => write!(f, "Buffer(<{} bytes>)", buffer.len()),
        }
    }
}

// ============================================================================
// ValueMap
// ============================================================================

/// Map of values that keeps insertion order.
///
/// Keys are compared by equality rather than hashed, since `Value` carries
/// floats. Inserting an existing key replaces its value in place.
#[derive(Clone, Debug, Default)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Create an empty map with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert an entry, returning the previous value for the key
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Look up a value by key equality
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up a value by string key
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Remove an entry by key, preserving the order of the rest
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).map_or(false, |o| o == v))
    }
}

impl<K: Into<Value>, V: Into<Value>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for ValueMap {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// ============================================================================
// BufferRef
// ============================================================================

/// Shared native byte buffer.
///
/// The buffer is never copied into the encoded byte stream; the receiver gets
/// the same allocation through the side table. Equality is identity.
#[derive(Clone)]
pub struct BufferRef {
    data: Arc<[u8]>,
}

impl BufferRef {
    /// Wrap bytes in a shared buffer
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    /// Buffer contents
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Buffer length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check if two references point to the same buffer
    pub fn ptr_eq(&self, other: &BufferRef) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef").field("len", &self.len()).finish()
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Error converting a `Value` into a Rust type
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Type mismatch: expected {expected}, got {got}")]
pub struct ValueConversionError {
    /// Expected type name
    pub expected: &'static str,
    /// Actual type name
    pub got: &'static str,
}

macro_rules! impl_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        }
    };
}

impl_from!(bool, Bool);
impl_from!(i64, I64);
impl_from!(i32, I64);
impl_from!(u32, I64);
impl_from!(f64, F64);
impl_from!(String, String);
impl_from!(&str, String);
impl_from!(Vec<Value>, List);
impl_from!(ValueMap, Map);
impl_from!(HandleRef, Handle);
impl_from!(BufferRef, Buffer);

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

macro_rules! impl_try_from {
    ($ty:ty, $name:literal, $pattern:pat => $out:expr) => {
        impl TryFrom<Value> for $ty {
            type Error = ValueConversionError;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    $pattern => Ok($out),
                    other => Err(ValueConversionError {
                        expected: $name,
                        got: other.type_name(),
                    }),
                }
            }
        }
    };
}

impl_try_from!(bool, "bool", Value::Bool(b) => b);
impl_try_from!(i64, "i64", Value::I64(i) => i);
impl_try_from!(f64, "f64", Value::F64(f) => f);
impl_try_from!(String, "string", Value::String(s) => s);
impl_try_from!(Vec<u8>, "bytes", Value::Bytes(b) => b);
impl_try_from!(Vec<Value>, "list", Value::List(items) => items);
impl_try_from!(ValueMap, "map", Value::Map(map) => map);
impl_try_from!(HandleRef, "handle", Value::Handle(h) => h);
impl_try_from!(BufferRef, "buffer", Value::Buffer(b) => b);
