//! Query key descriptors and canonical encoding.
//!
//! Callers identify a logical query with a [`QueryKey`] descriptor: a plain
//! string, an ordered sequence, or a field map. Descriptors are never stored
//! as-is; every component works on the deterministic [`CanonicalKey`] string
//! form, where map field order never affects the result.

use std::fmt;

use serde_json::{Map, Value};

/// Separator between stringified sequence elements.
const SEPARATOR: &str = ":";

/// A caller-supplied query identifier descriptor.
///
/// Sequences are order-significant (`["posts", 2]` is not `[2, "posts"]`);
/// field maps are not (`{a, b}` and `{b, a}` canonicalize identically).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKey {
    /// A plain string key, passed through unchanged.
    Text(String),
    /// An ordered sequence of primitives/objects, e.g. `[list, page, filters]`.
    Seq(Vec<Value>),
    /// A field map; key order is irrelevant.
    Fields(Map<String, Value>),
}

impl QueryKey {
    /// Encode this descriptor into its canonical string form.
    ///
    /// Structurally equal descriptors always produce equal canonical keys.
    pub fn canonical(&self) -> CanonicalKey {
        match self {
            Self::Text(text) => CanonicalKey(text.clone()),
            Self::Seq(items) => {
                let parts: Vec<String> = items.iter().map(element_text).collect();
                CanonicalKey(parts.join(SEPARATOR))
            }
            Self::Fields(map) => CanonicalKey(canonical_object(map)),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for QueryKey {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(items: Vec<Value>) -> Self {
        Self::Seq(items)
    }
}

impl From<Map<String, Value>> for QueryKey {
    fn from(map: Map<String, Value>) -> Self {
        Self::Fields(map)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Array(items) => Self::Seq(items),
            Value::Object(map) => Self::Fields(map),
            other => Self::Text(element_text(&other)),
        }
    }
}

/// The canonical string form of a query identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CanonicalKey> for String {
    fn from(key: CanonicalKey) -> Self {
        key.0
    }
}

/// Stringify a sequence element: strings bare, other primitives as their
/// literal text, composites as canonical JSON.
fn element_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => canonical_json(value),
    }
}

/// Serialize a value as JSON with every object's keys recursively sorted,
/// independent of how the input map is ordered.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => canonical_object(map),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn canonical_object(map: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let fields: Vec<String> = keys
        .iter()
        .map(|key| {
            let value = &map[key.as_str()];
            format!("{}:{}", Value::String((*key).clone()), canonical_json(value))
        })
        .collect();
    format!("{{{}}}", fields.join(","))
}
