//! Dynamic value model shared by the state store and the event bus.
//!
//! A [`Value`] is an owned, acyclic tree: primitives, timestamps, ordered
//! lists, sets of primitives and nested records. `Clone` is a deep copy and
//! `PartialEq` is structural equality:
//!
//! - integers and floats compare numerically (`1 == 1.0`),
//! - lists compare element by element in order,
//! - sets ignore insertion order,
//! - records compare key by key.

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Error, Result};

/// Nested key/value record.
pub type Record = BTreeMap<String, Value>;

/// A value stored in the state document or carried as an event payload.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Set(ValueSet),
    Record(Record),
}

impl Value {
    /// An empty record.
    pub fn record() -> Self {
        Value::Record(Record::new())
    }

    /// Build a record from `(key, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Record(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short type label used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Record(_) => "record",
        }
    }

    /// Primitives are the only values allowed inside a [`ValueSet`].
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Null
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Str(_)
                | Value::Timestamp(_)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&ValueSet> {
        match self {
            Value::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Field lookup on a record; `None` for non-records and missing keys.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.as_record().and_then(|r| r.get(key))
    }

    /// Convert to plain JSON. Timestamps become RFC 3339 strings and sets
    /// become arrays.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Timestamp(ts) => Json::String(ts.to_rfc3339()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Set(set) => Json::Array(set.iter().map(Value::to_json).collect()),
            Value::Record(r) => Json::Object(
                r.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // NaN equals NaN so rewriting it is not a change.
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                int_eq_float(*a, *b)
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

/// Exact comparison; casting the int would round above 2^53.
fn int_eq_float(int: i64, float: f64) -> bool {
    float.fract() == 0.0
        && float >= i64::MIN as f64
        && float < i64::MAX as f64
        && float as i64 == int
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Set(set) => {
                let mut seq = serializer.serialize_seq(Some(set.len()))?;
                for item in set.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Record(r) => {
                let mut map = serializer.serialize_map(Some(r.len()))?;
                for (k, v) in r {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

// =============================================================================
// ValueSet
// =============================================================================

/// Small set of primitive values. Keeps insertion order for iteration but
/// compares order-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ValueSet {
    items: Vec<Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a primitive. Returns `Ok(false)` if it was already present.
    pub fn insert(&mut self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        if !value.is_primitive() {
            return Err(Error::validation(format!(
                "sets hold primitives only, got {}",
                value.type_name()
            )));
        }
        if self.contains(&value) {
            return Ok(false);
        }
        self.items.push(value);
        Ok(true)
    }

    pub fn remove(&mut self, value: &Value) -> bool {
        let before = self.items.len();
        self.items.retain(|v| v != value);
        self.items.len() != before
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.items.iter().any(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    /// Build a set from primitives, dropping duplicates.
    pub fn try_from_iter<I, V>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut set = Self::new();
        for v in values {
            set.insert(v)?;
        }
        Ok(set)
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len() && self.items.iter().all(|v| other.contains(v))
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        i64::try_from(n)
            .map(Value::Int)
            .unwrap_or(Value::Float(n as f64))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ValueSet> for Value {
    fn from(set: ValueSet) -> Self {
        Value::Set(set)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                Value::Record(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_numeric_equality_crosses_int_and_float() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Float(1.5));
        assert_ne!(Value::Int(1), Value::Str("1".into()));
    }

    #[test]
    fn test_nan_equals_itself() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(f64::NAN), Value::Float(0.0));
        assert_ne!(Value::Float(f64::NAN), Value::Int(0));
    }

    #[test]
    fn test_large_ints_compare_exactly_with_floats() {
        let big = 9_007_199_254_740_993_i64;
        assert_ne!(Value::Int(big), Value::Float(9_007_199_254_740_992.0));
        assert_eq!(Value::Int(1 << 53), Value::Float(9_007_199_254_740_992.0));
        assert_ne!(Value::Int(i64::MAX), Value::Float(i64::MAX as f64));
        assert_ne!(Value::Int(0), Value::Float(f64::INFINITY));

        let mut set = ValueSet::new();
        assert!(set.insert(Value::Int(big)).unwrap());
        assert!(set.insert(Value::Float(9_007_199_254_740_992.0)).unwrap());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_equality_ignores_order() {
        let a = ValueSet::try_from_iter(["rock", "jazz", "folk"]).unwrap();
        let b = ValueSet::try_from_iter(["folk", "rock", "jazz"]).unwrap();
        assert_eq!(Value::Set(a), Value::Set(b));
    }

    #[test]
    fn test_list_equality_respects_order() {
        let a = Value::from(json!([1, 2, 3]));
        let b = Value::from(json!([3, 2, 1]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_rejects_non_primitives() {
        let mut set = ValueSet::new();
        assert!(set.insert(Value::record()).is_err());
        assert!(set.insert(1).unwrap());
        assert!(!set.insert(1).unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_clone_is_deep() {
        let original = Value::from(json!({"ui": {"zoom": 1.0, "panels": ["tree"]}}));
        let mut copy = original.clone();
        if let Some(ui) = copy.as_record_mut().and_then(|r| r.get_mut("ui")) {
            if let Some(r) = ui.as_record_mut() {
                r.insert("zoom".into(), Value::Float(2.0));
            }
        }
        assert_eq!(
            original.field("ui").and_then(|u| u.field("zoom")),
            Some(&Value::Float(1.0))
        );
        assert_ne!(original, copy);
    }

    #[test]
    fn test_to_json_flattens_sets_and_timestamps() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let value = Value::from_pairs([
            ("at", Value::Timestamp(ts)),
            ("tags", Value::Set(ValueSet::try_from_iter(["a"]).unwrap())),
        ]);
        assert_eq!(
            value.to_json(),
            json!({"at": "2024-05-01T10:00:00+00:00", "tags": ["a"]})
        );
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,8}".prop_map(Value::Str),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(Value::Record),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_clone_is_deep_equal(v in arb_value()) {
            prop_assert_eq!(v.clone(), v);
        }

        #[test]
        fn prop_json_round_trip_preserves_equality(v in arb_value()) {
            prop_assert_eq!(Value::from(v.to_json()), v);
        }
    }
}
