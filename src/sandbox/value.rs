//! Host-side representation of Lua values.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::sandbox::table::TableRef;

/// A value crossing the boundary between the host and the interpreter.
///
/// Lua numbers are always carried as `f64`; the interpreter's integer
/// subtype is not distinguished on the host side.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    /// Raw bytes; Lua strings may hold any byte, including NUL.
    String(Vec<u8>),
    /// A live reference to a table that stays inside the interpreter.
    Table(TableRef),
    /// An eager, recursive copy of a table's contents.
    Map(HashMap<MapKey, Value>),
}

impl Value {
    /// Name of this value's kind, as used in conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table reference",
            Value::Map(_) => "map",
        }
    }

    /// Check if this is `nil`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// The number, if this is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The raw string bytes, if this is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The string contents, if this is a string holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// The table reference, if this is one.
    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(table) => Some(table),
            _ => None,
        }
    }

    /// The copied table contents, if this is a map.
    pub fn as_map(&self) -> Option<&HashMap<MapKey, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(n.into())
    }
}

// Every Rust integer lies inside the f64 range; large magnitudes round to
// the nearest representable double.
macro_rules! number_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

number_from_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::String(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::String(bytes)
    }
}

impl From<TableRef> for Value {
    fn from(table: TableRef) -> Self {
        Value::Table(table)
    }
}

impl From<HashMap<MapKey, Value>> for Value {
    fn from(map: HashMap<MapKey, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Nil)
    }
}

impl From<MapKey> for Value {
    fn from(key: MapKey) -> Self {
        match key {
            MapKey::Boolean(b) => Value::Boolean(b),
            MapKey::Number(n) => Value::Number(n),
            MapKey::String(bytes) => Value::String(bytes),
        }
    }
}

/// A key of an eagerly copied table.
///
/// Only the Lua key types with a hashable host form are representable:
/// tables, functions and other reference types used as keys cannot be copied.
#[derive(Debug, Clone)]
pub enum MapKey {
    Boolean(bool),
    /// Never NaN: Lua rejects NaN keys.
    Number(f64),
    String(Vec<u8>),
}

impl MapKey {
    // -0.0 and 0.0 index the same Lua slot.
    fn number_bits(n: f64) -> u64 {
        if n == 0.0 {
            0.0f64.to_bits()
        } else {
            n.to_bits()
        }
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MapKey::Boolean(a), MapKey::Boolean(b)) => a == b,
            (MapKey::Number(a), MapKey::Number(b)) => Self::number_bits(*a) == Self::number_bits(*b),
            (MapKey::String(a), MapKey::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            MapKey::Boolean(b) => b.hash(state),
            MapKey::Number(n) => Self::number_bits(*n).hash(state),
            MapKey::String(bytes) => bytes.hash(state),
        }
    }
}

impl From<bool> for MapKey {
    fn from(b: bool) -> Self {
        MapKey::Boolean(b)
    }
}

impl From<f64> for MapKey {
    fn from(n: f64) -> Self {
        MapKey::Number(n)
    }
}

impl From<i32> for MapKey {
    fn from(n: i32) -> Self {
        MapKey::Number(n.into())
    }
}

impl From<i64> for MapKey {
    fn from(n: i64) -> Self {
        MapKey::Number(n as f64)
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::String(s.as_bytes().to_vec())
    }
}

impl From<String> for MapKey {
    fn from(s: String) -> Self {
        MapKey::String(s.into_bytes())
    }
}

impl From<&[u8]> for MapKey {
    fn from(bytes: &[u8]) -> Self {
        MapKey::String(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(2), Value::Number(2.0));
        assert_eq!(Value::from(u64::MAX), Value::Number(u64::MAX as f64));
        assert_eq!(Value::from("a\0b"), Value::String(b"a\0b".to_vec()));
        assert_eq!(Value::from(None::<bool>), Value::Nil);
        assert_eq!(Value::from(Some(true)), Value::Boolean(true));
    }

    #[test]
    fn test_accessors() {
        let value = Value::from("hello");
        assert_eq!(value.as_str(), Some("hello"));
        assert_eq!(value.as_number(), None);
        assert_eq!(value.type_name(), "string");

        let invalid = Value::String(vec![0xff, 0xfe]);
        assert_eq!(invalid.as_bytes(), Some(&[0xff, 0xfe][..]));
        assert!(invalid.as_str().is_none());

        assert!(Value::default().is_nil());
    }

    #[test]
    fn test_map_key_zero_normalisation() {
        let mut map = HashMap::new();
        map.insert(MapKey::Number(-0.0), Value::from(1));
        assert_eq!(map.get(&MapKey::from(0)), Some(&Value::Number(1.0)));
        assert_ne!(MapKey::from("1"), MapKey::from(1));
    }
}
