//! The plain data model shared by variables and payloads.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::structural::deep_equal;

/// A plain data tree: scalars, ordered sequences, and string-keyed mappings.
///
/// Composite nodes are reference counted, which makes clones cheap and makes
/// *instance identity* observable: two values can be structurally equal while
/// being distinct instances. Structural sharing (see [`crate::structural`])
/// exploits this so that consumers comparing by identity can skip work when a
/// fresh payload turns out to be identical to what they already hold.
///
/// Mappings are ordered by key, so the canonical encoding used by
/// [`CacheKey`](crate::CacheKey) is deterministic.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// All numbers are `f64`, matching the plain-data model this mirrors.
    Number(f64),
    String(Arc<str>),
    Array(Arc<[Value]>),
    Object(Arc<BTreeMap<String, Value>>),
}

impl Value {
    /// Instance identity: scalars compare by value, composites by pointer.
    pub fn same_instance(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Looks up a mapping key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|fields| fields.get(key))
    }
}

/// Deep structural equality, including the rule that a mapping key holding
/// `Null` is equal to an absent key. See [`deep_equal`].
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        deep_equal(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Number(v) => write!(f, "Number({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::Array(v) => f.debug_list().entries(v.iter()).finish(),
            Value::Object(v) => f.debug_map().entries(v.iter()).finish(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v.into())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Object(Arc::new(v))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Bool(v),
            serde_json::Value::Number(v) => Value::Number(v.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(v) => Value::String(v.into()),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(Arc::new(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            )),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(v) => (*v).into(),
            Value::Number(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(v) => serde_json::Value::String(v.to_string()),
            Value::Array(items) => items.iter().map(serde_json::Value::from).collect(),
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.into()))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Number(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in fields.iter() {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_interop() {
        let value = Value::from(json!({"user": {"id": 7, "tags": ["a", "b"]}, "active": true}));
        let round_tripped: serde_json::Value = (&value).into();
        assert_eq!(
            round_tripped,
            json!({"active": true, "user": {"id": 7.0, "tags": ["a", "b"]}})
        );
        assert_eq!(value.get("active"), Some(&Value::Bool(true)));
        assert_eq!(
            value.get("user").and_then(|user| user.get("id")),
            Some(&Value::Number(7.0))
        );
    }

    #[test]
    fn test_instance_identity() {
        let shared = Value::from(json!([1, 2, 3]));
        assert!(Value::same_instance(&shared, &shared.clone()));

        let equal = Value::from(json!([1, 2, 3]));
        assert_eq!(shared, equal);
        assert!(!Value::same_instance(&shared, &equal));

        // Scalars have no identity beyond their value.
        assert!(Value::same_instance(&Value::from("x"), &Value::from("x")));
        assert!(!Value::same_instance(
            &Value::Number(f64::NAN),
            &Value::Number(f64::NAN)
        ));
    }

    #[test]
    fn test_null_equals_absent_key() {
        let explicit = Value::from(json!({"a": 1, "b": null}));
        let implicit = Value::from(json!({"a": 1}));
        assert_eq!(explicit, implicit);
        assert_ne!(explicit, Value::from(json!({"a": 1, "b": 2})));
    }
}
