//! The opaque, closed-sum value type used for `executionData`, `stepData`
//! and `actionData`. Serializes to JSON at the persistence boundary and is
//! consumed directly by the condition evaluator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Truthiness used by the condition evaluator's `!` operator and as a
    /// fallback when a bare reference appears where a boolean is expected.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Map(m) => current = m.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::List(_) | Value::Map(_) => {
                write!(f, "{}", serde_json::to_string(self).unwrap_or_default())
            }
        }
    }
}

/// A string-keyed bag of `Value`s; the concrete representation backing
/// `executionData`, `stepData`, and `actionData`.
pub type ValueMap = HashMap<String, Value>;

pub fn value_map_to_json(map: &ValueMap) -> serde_json::Result<String> {
    serde_json::to_string(map)
}

pub fn value_map_from_json(raw: &str) -> serde_json::Result<ValueMap> {
    if raw.trim().is_empty() {
        return Ok(ValueMap::new());
    }
    serde_json::from_str(raw)
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_emptiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(Value::Number(1.0).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
    }

    #[test]
    fn round_trips_through_json() {
        let mut map = ValueMap::new();
        map.insert("path".to_string(), Value::String("L".to_string()));
        map.insert("qty".to_string(), Value::Number(5.0));
        let json = value_map_to_json(&map).unwrap();
        let back = value_map_from_json(&json).unwrap();
        assert_eq!(back.get("path").unwrap().as_str(), Some("L"));
        assert_eq!(back.get("qty").unwrap().as_number(), Some(5.0));
    }

    #[test]
    fn empty_string_decodes_to_empty_map() {
        let map = value_map_from_json("").unwrap();
        assert!(map.is_empty());
    }
}
