// qbus_common/src/types/value.rs
//
// Canonical payload value tree for the bus.
//
// INTENTION: One tagged sum covers everything a frame payload or a handler
// message can hold. Nodes keep their insertion order (IndexMap) because JSON
// consumers on the far side of the wire rely on it.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A tagged, structured value carried inside frames and handler messages.
///
/// `Int` and `Float` are distinct variants; on the wire they are told apart
/// by the absence or presence of a decimal point.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Node(IndexMap<String, Value>),
}

impl Value {
    /// An empty ordered map.
    pub fn node() -> Self {
        Value::Node(IndexMap::new())
    }

    /// An empty sequence.
    pub fn list() -> Self {
        Value::List(Vec::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Value::Node(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    /// Number of entries in a node or list; 0 for scalars.
    pub fn len(&self) -> usize {
        match self {
            Value::Node(entries) => entries.len(),
            Value::List(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Node(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_node_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Value::Node(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Child of a node by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_node().and_then(|entries| entries.get(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.as_node_mut().and_then(|entries| entries.get_mut(key))
    }

    /// Insert into a node; does nothing on other variants. Returns the
    /// replaced value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.as_node_mut()
            .and_then(|entries| entries.insert(key.into(), value.into()))
    }

    /// Append to a list; does nothing on other variants.
    pub fn push(&mut self, value: impl Into<Value>) {
        if let Value::List(items) = self {
            items.push(value.into());
        }
    }

    /// Move the value out, leaving `Null` behind. This is how payload
    /// ownership travels frame -> message -> handler -> frame without copy.
    pub fn take(&mut self) -> Value {
        std::mem::take(self)
    }

    /// Deep merge of `other` over `self`: node entries merge recursively,
    /// everything else is replaced by `other`.
    pub fn merge(&mut self, other: Value) {
        match (self, other) {
            (Value::Node(into), Value::Node(from)) => {
                for (key, value) in from {
                    match into.get_mut(&key) {
                        Some(existing) => existing.merge(value),
                        None => {
                            into.insert(key, value);
                        }
                    }
                }
            }
            (slot, other) => *slot = other,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(v: IndexMap<String, Value>) -> Self {
        Value::Node(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<unprintable>"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::String(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Node(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON value")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        Deserialize::deserialize(deserializer)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        // NUMBER is signed 64-bit on the wire; anything wider degrades.
        if v <= i64::MAX as u64 {
            Ok(Value::Int(v as i64))
        } else {
            Ok(Value::Float(v as f64))
        }
    }

    fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_seq<A>(self, mut access: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some(item) = access.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            entries.insert(key, value);
        }
        Ok(Value::Node(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_preserves_insertion_order() {
        let mut node = Value::node();
        node.insert("zeta", 1i64);
        node.insert("alpha", 2i64);
        node.insert("mid", 3i64);

        let keys: Vec<&String> = node.as_node().unwrap().keys().collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);

        let text = serde_json::to_string(&node).unwrap();
        assert_eq!(text, r#"{"zeta":1,"alpha":2,"mid":3}"#);
    }

    #[test]
    fn json_distinguishes_int_and_float() {
        let parsed: Value = serde_json::from_str(r#"{"n":7,"x":7.5}"#).unwrap();
        assert_eq!(parsed.get("n"), Some(&Value::Int(7)));
        assert_eq!(parsed.get("x"), Some(&Value::Float(7.5)));
    }

    #[test]
    fn round_trip_is_structural() {
        let parsed: Value =
            serde_json::from_str(r#"{"a":[1,2.5,"s",true,null],"b":{"c":{"d":-4}}}"#).unwrap();
        let text = serde_json::to_string(&parsed).unwrap();
        let again: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, again);
    }

    #[test]
    fn merge_prefers_other_and_recurses() {
        let mut base: Value = serde_json::from_str(r#"{"keep":1,"deep":{"a":1,"b":2}}"#).unwrap();
        let over: Value = serde_json::from_str(r#"{"deep":{"b":9,"c":3},"new":true}"#).unwrap();
        base.merge(over);

        assert_eq!(base.get("keep"), Some(&Value::Int(1)));
        assert_eq!(base.get("new"), Some(&Value::Bool(true)));
        let deep = base.get("deep").unwrap();
        assert_eq!(deep.get("a"), Some(&Value::Int(1)));
        assert_eq!(deep.get("b"), Some(&Value::Int(9)));
        assert_eq!(deep.get("c"), Some(&Value::Int(3)));
    }

    #[test]
    fn take_leaves_null_behind() {
        let mut node = Value::node();
        node.insert("x", 42i64);
        let moved = node.take();
        assert!(node.is_null());
        assert_eq!(moved.get("x"), Some(&Value::Int(42)));
    }
}
