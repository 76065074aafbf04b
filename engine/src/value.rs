//! Typed attribute values.
//!
//! Records are maps of attribute name to [`Value`]. The taxonomy is closed so
//! that diff, apply and transform can match exhaustively.

use crate::Key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map of a record (or of a nested object).
///
/// BTreeMap keeps serialization and iteration deterministic.
pub type Attributes = BTreeMap<String, Value>;

/// A numeric value.
///
/// Integers stay integers through arithmetic until they overflow or meet a
/// float, so that counters round-trip exactly.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Number::Int(i) => i == 0,
            Number::Float(f) => f == 0.0,
        }
    }

    /// `self + other`.
    pub fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(sum) => Number::Int(sum),
                None => Number::Float(a as f64 + b as f64),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    /// `self - other`, i.e. the delta that takes `other` to `self`.
    pub fn sub(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_sub(b) {
                Some(delta) => Number::Int(delta),
                None => Number::Float(a as f64 - b as f64),
            },
            (a, b) => Number::Float(a.as_f64() - b.as_f64()),
        }
    }

    fn to_json(self) -> serde_json::Value {
        match self {
            Number::Int(i) => serde_json::Value::from(i),
            Number::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }

    fn from_json(n: &serde_json::Number) -> Number {
        match n.as_i64() {
            Some(i) => Number::Int(i),
            None => Number::Float(n.as_f64().unwrap_or(0.0)),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::Int(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::Float(value)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{i}"),
            Number::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Reference to a binary blob transferred out of band.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryRef {
    pub id: String,
}

/// Reference to another record, possibly in another bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub key: Key,
}

/// A typed attribute value.
///
/// On the wire references are plain strings; the bucket schema turns them
/// back into [`Value::Binary`] / [`Value::Entity`] (see
/// [`BucketSchema::decode`](crate::schema::BucketSchema::decode)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    Object(Attributes),
    Binary(BinaryRef),
    Entity(EntityRef),
}

impl Value {
    /// Create an entity reference.
    pub fn entity(key: impl Into<Key>) -> Self {
        Value::Entity(EntityRef { key: key.into() })
    }

    /// Create a binary reference.
    pub fn binary(id: impl Into<String>) -> Self {
        Value::Binary(BinaryRef { id: id.into() })
    }

    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::String(_) => "Text",
            Value::List(_) => "List",
            Value::Object(_) => "Object",
            Value::Binary(_) => "Binary",
            Value::Entity(_) => "Entity",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Attributes> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Value::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    /// Convert to plain JSON. References become their key/id string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => n.to_json(),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Binary(b) => serde_json::Value::String(b.id.clone()),
            Value::Entity(e) => serde_json::Value::String(e.key.clone()),
        }
    }

    /// Convert from plain JSON. Never produces references.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(Number::from_json(n)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(&json)
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(Number::Int(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(Number::Float(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Attributes> for Value {
    fn from(value: Attributes) -> Self {
        Value::Object(value)
    }
}

/// Build [`Attributes`] from a JSON object literal.
///
/// Non-object JSON yields an empty map.
pub fn attributes(json: serde_json::Value) -> Attributes {
    match Value::from_json(&json) {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}
