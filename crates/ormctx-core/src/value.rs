//! Dynamic column values.

use crate::error::{Error, TypeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A dynamically-typed column value.
///
/// Entity fields, primary keys, foreign keys and statement parameters are all
/// carried as `Value`s. Equality is by contents, which is what dirty checking
/// relies on: two embedded value objects with equal components compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Embedded value object, component name to component value.
    ///
    /// Flattened into one column per component when written.
    Embedded(BTreeMap<String, Value>),

    /// Ordered elements of a value collection.
    ///
    /// Written as one row per element into the collection's own table.
    List(Vec<Value>),
}

impl Value {
    /// Build an embedded value from `(component, value)` pairs.
    pub fn embedded<K, V, I>(components: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Embedded(
            components
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a list value from its elements.
    pub fn list<V, I>(elements: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Value::List(elements.into_iter().map(Into::into).collect())
    }

    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Embedded(_) => "EMBEDDED",
            Value::List(_) => "LIST",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            #[allow(clippy::cast_precision_loss)]
            Value::BigInt(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get the components of an embedded value.
    pub fn as_embedded(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Embedded(map) => Some(map),
            _ => None,
        }
    }

    /// Elements of a list value. NULL reads as an empty collection.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(elements) => Some(elements),
            Value::Null => Some(&[]),
            _ => None,
        }
    }

    /// Get one component of an embedded value.
    ///
    /// NULL (an absent value object) yields NULL for every component.
    pub fn component(&self, name: &str) -> Value {
        match self {
            Value::Embedded(map) => map.get(name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Equality used for keys: integers compare by numeric value whatever
    /// their width, floats by bit pattern so that the relation is reflexive.
    pub fn key_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::BigInt(b)) | (Value::BigInt(b), Value::Int(a)) => {
                i64::from(*a) == *b
            }
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Embedded(a), Value::Embedded(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.key_eq(vb))
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key_eq(y))
            }
            _ => self == other,
        }
    }

    /// Feed this value into a hasher, consistent with [`Value::key_eq`].
    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            // Int and BigInt hash alike.
            Value::Int(i) => {
                2u8.hash(hasher);
                i64::from(*i).hash(hasher);
            }
            Value::BigInt(i) => {
                2u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Double(f) => {
                3u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                4u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                5u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                6u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Date(d) => {
                7u8.hash(hasher);
                d.hash(hasher);
            }
            Value::Timestamp(ts) => {
                8u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                9u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                10u8.hash(hasher);
                j.to_string().hash(hasher);
            }
            Value::Embedded(map) => {
                11u8.hash(hasher);
                map.len().hash(hasher);
                for (k, v) in map {
                    k.hash(hasher);
                    v.hash_into(hasher);
                }
            }
            Value::List(elements) => {
                12u8.hash(hasher);
                elements.len().hash(hasher);
                for element in elements {
                    element.hash_into(hasher);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Decimal(s) => write!(f, "{}", s),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "date({})", d),
            Value::Timestamp(ts) => write!(f, "ts({})", ts),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{}", j),
            Value::Embedded(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

fn type_error(expected: &'static str, actual: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.type_name().to_string(),
        column: None,
    })
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| type_error("bool", &value))
    }
}

impl TryFrom<Value> for i32 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(v) => Ok(v),
            Value::BigInt(v) => i32::try_from(v).map_err(|_| Error::Type(TypeError {
                expected: "i32",
                actual: format!("BIGINT {} out of range", v),
                column: None,
            })),
            other => Err(type_error("i32", &other)),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| type_error("i64", &value))
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| type_error("f64", &value))
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(v) | Value::Decimal(v) => Ok(v),
            other => Err(type_error("String", &other)),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash_into(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_from_primitives() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(7i32), Value::Int(7));
        assert_eq!(Value::from(7i64), Value::BigInt(7));
        assert_eq!(Value::from("x"), Value::Text("x".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_embedded_equality_is_by_contents() {
        let a = Value::embedded([("amount", Value::BigInt(10)), ("currency", "KRW".into())]);
        let b = Value::embedded([("currency", Value::from("KRW")), ("amount", Value::BigInt(10))]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.component("currency"), Value::from("KRW"));
        assert_eq!(a.component("missing"), Value::Null);
        assert_eq!(Value::Null.component("amount"), Value::Null);
    }

    #[test]
    fn test_key_eq_floats_by_bits() {
        let nan = Value::Double(f64::NAN);
        assert!(nan.key_eq(&nan.clone()));
        assert_ne!(nan, nan.clone());
    }

    #[test]
    fn test_int_widths_are_one_key() {
        assert_eq!(hash_of(&Value::Int(5)), hash_of(&Value::BigInt(5)));
        assert!(Value::Int(5).key_eq(&Value::BigInt(5)));
    }

    #[test]
    fn test_try_from() {
        assert_eq!(i64::try_from(Value::Int(3)).unwrap(), 3);
        assert_eq!(i32::try_from(Value::BigInt(3)).unwrap(), 3);
        assert!(i32::try_from(Value::BigInt(i64::MAX)).is_err());
        assert_eq!(
            Option::<String>::try_from(Value::Null).unwrap(),
            None::<String>
        );
        assert!(String::try_from(Value::Bool(true)).is_err());
    }

    #[test]
    fn test_list_compares_in_order() {
        let sizes = Value::list(["S", "M"]);
        assert_eq!(sizes, Value::list(["S", "M"]));
        assert_ne!(sizes, Value::list(["M", "S"]));
        assert!(Value::list([Value::Int(1)]).key_eq(&Value::list([Value::BigInt(1)])));
        assert_eq!(
            hash_of(&Value::list([Value::Int(1)])),
            hash_of(&Value::list([Value::BigInt(1)]))
        );
        assert_eq!(Value::Null.as_list(), Some(&[][..]));
        assert_eq!(sizes.to_string(), "['S', 'M']");
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::BigInt(42).to_string(), "42");
        assert_eq!(Value::from("a").to_string(), "'a'");
        assert_eq!(
            Value::embedded([("a", 1i64)]).to_string(),
            "{a: 1}"
        );
    }
}
