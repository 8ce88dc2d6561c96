//! Structured values exchanged over the bus.
//!
//! A `Value` is the decoded form of an attribute stream: a tree of tables,
//! arrays and typed scalars. `ValueKind` is the numeric tag carried on the
//! wire and in method signatures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wire-level kind of a value.
///
/// `Unspec` doubles as "any kind" inside an argument policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ValueKind {
    Unspec = 0,
    Array = 1,
    Table = 2,
    String = 3,
    Int64 = 4,
    Int32 = 5,
    Int16 = 6,
    Int8 = 7,
    Double = 8,
    Bool = 9,
}

impl ValueKind {
    pub const ALL: [ValueKind; 10] = [
        ValueKind::Unspec,
        ValueKind::Array,
        ValueKind::Table,
        ValueKind::String,
        ValueKind::Int64,
        ValueKind::Int32,
        ValueKind::Int16,
        ValueKind::Int8,
        ValueKind::Double,
        ValueKind::Bool,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Unspec => "unspec",
            ValueKind::Array => "array",
            ValueKind::Table => "table",
            ValueKind::String => "string",
            ValueKind::Int64 => "int64",
            ValueKind::Int32 => "int32",
            ValueKind::Int16 => "int16",
            ValueKind::Int8 => "int8",
            ValueKind::Double => "double",
            ValueKind::Bool => "bool",
        }
    }

    /// Whether a value of kind `actual` satisfies a policy declaring `self`.
    pub fn accepts(self, actual: ValueKind) -> bool {
        self == ValueKind::Unspec || self == actual
    }
}

impl From<ValueKind> for u8 {
    fn from(kind: ValueKind) -> Self {
        kind.tag()
    }
}

impl TryFrom<u8> for ValueKind {
    type Error = String;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        ValueKind::from_tag(tag).ok_or_else(|| format!("unknown value kind tag {}", tag))
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded structured value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unspec,
    Array(Vec<Value>),
    Table(BTreeMap<String, Value>),
    String(String),
    Int64(i64),
    Int32(i32),
    Int16(i16),
    Int8(i8),
    Double(f64),
    Bool(bool),
}

impl Value {
    /// Build a table from key/value pairs.
    pub fn table<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Table(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// An empty table, the smallest valid message.
    pub fn empty_table() -> Self {
        Value::Table(BTreeMap::new())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unspec => ValueKind::Unspec,
            Value::Array(_) => ValueKind::Array,
            Value::Table(_) => ValueKind::Table,
            Value::String(_) => ValueKind::String,
            Value::Int64(_) => ValueKind::Int64,
            Value::Int32(_) => ValueKind::Int32,
            Value::Int16(_) => ValueKind::Int16,
            Value::Int8(_) => ValueKind::Int8,
            Value::Double(_) => ValueKind::Double,
            Value::Bool(_) => ValueKind::Bool,
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Value::Table(_))
    }

    pub fn as_table(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Table(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer width, widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int64(v) => Some(v),
            Value::Int32(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::Int8(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Look up a key in a table value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_table().and_then(|map| map.get(key))
    }

    /// Convert to JSON. Non-finite doubles become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Unspec => Json::Null,
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Table(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::String(s) => Json::String(s.clone()),
            Value::Int64(v) => Json::from(*v),
            Value::Int32(v) => Json::from(*v),
            Value::Int16(v) => Json::from(*v),
            Value::Int8(v) => Json::from(*v),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Bool(v) => Json::Bool(*v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Unspec,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => Value::Int32(small),
                        Err(_) => Value::Int64(i),
                    }
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                Value::Table(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        value.to_json()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int8(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Table(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_tags() {
        for (tag, kind) in ValueKind::ALL.iter().enumerate() {
            assert_eq!(kind.tag() as usize, tag);
            assert_eq!(ValueKind::from_tag(tag as u8), Some(*kind));
        }
        assert_eq!(ValueKind::from_tag(10), None);
        assert_ne!(ValueKind::Bool, ValueKind::Int8);
    }

    #[test]
    fn test_kind_serializes_as_number() {
        assert_eq!(serde_json::to_string(&ValueKind::Int32).unwrap(), "5");
        let kind: ValueKind = serde_json::from_str("9").unwrap();
        assert_eq!(kind, ValueKind::Bool);
        assert!(serde_json::from_str::<ValueKind>("42").is_err());
    }

    #[test]
    fn test_unspec_accepts_anything() {
        assert!(ValueKind::Unspec.accepts(ValueKind::Table));
        assert!(ValueKind::Int32.accepts(ValueKind::Int32));
        assert!(!ValueKind::Int32.accepts(ValueKind::Int64));
    }

    #[test]
    fn test_from_json_integer_widths() {
        let value = Value::from(json!({"a": 1, "b": 5_000_000_000i64, "c": 1.5, "d": null}));
        assert_eq!(value.get("a"), Some(&Value::Int32(1)));
        assert_eq!(value.get("b"), Some(&Value::Int64(5_000_000_000)));
        assert_eq!(value.get("c"), Some(&Value::Double(1.5)));
        assert_eq!(value.get("d"), Some(&Value::Unspec));
    }

    #[test]
    fn test_to_json() {
        let value = Value::table([
            ("iface", Value::from("eth0")),
            ("up", Value::from(true)),
            ("mtu", Value::Int16(1500)),
            ("addrs", Value::Array(vec![Value::from("10.0.0.1")])),
        ]);
        assert_eq!(
            value.to_json(),
            json!({"iface": "eth0", "up": true, "mtu": 1500, "addrs": ["10.0.0.1"]})
        );
        assert_eq!(Value::Double(f64::NAN).to_json(), json!(null));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int8(-3).as_i64(), Some(-3));
        assert_eq!(Value::Int32(2).as_f64(), Some(2.0));
        assert_eq!(Value::from("x").as_i64(), None);
        assert!(Value::empty_table().is_table());
        assert_eq!(Value::from(3).get("a"), None);
    }
}
