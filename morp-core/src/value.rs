//! The flat field bag carried by every message: user data plus reserved
//! `_`-prefixed metadata, per spec §3. Replaces the original's duck-typed
//! `setattr`/`getattr` bag with an explicit, serializable value type.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reserved metadata keys, populated by the engine rather than the caller.
pub const ID: &str = "_id";
pub const COUNT: &str = "_count";
pub const CLASSPATH: &str = "_classpath";

/// A JSON-like value. Covers everything a message field or piece of
/// metadata needs to carry without pulling in `serde_json::Value`
/// directly into the public API (so `morp-core` stays serializer-agnostic
/// between the `Json` and `Binary` codecs).
///
/// Deliberately tagged (not `#[serde(untagged)]`): the `Binary` serializer
/// goes through bincode, which cannot deserialize self-describing/untagged
/// representations. The `Json` codec converts through `serde_json::Value`
/// directly (see `codec::serialize`/`deserialize`) rather than relying on
/// this type's own `Serialize` impl, so JSON on the wire stays plain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(_) => write!(f, "[array]"),
            Value::Map(_) => write!(f, "{{map}}"),
        }
    }
}

macro_rules! from_impl {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        }
    };
}

from_impl!(bool, Bool);
from_impl!(i64, Int);
from_impl!(i32, Int);
from_impl!(u32, Int);
from_impl!(f64, Float);
from_impl!(String, String);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl Value {
    /// Convert to a plain `serde_json::Value`, used by the `Json` codec so
    /// the wire format is ordinary JSON rather than a tagged enum.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::String(base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    b,
                ))
            }
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert from a plain `serde_json::Value`.
    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// The flat field bag sent to / received from an `Interface`.
pub type Fields = HashMap<String, Value>;

/// Metadata accessors shared by every engine and by the message model.
pub trait FieldsExt {
    fn id(&self) -> Option<&str>;
    fn set_id(&mut self, id: impl Into<String>);
    fn count(&self) -> i64;
    fn set_count(&mut self, count: i64);
    fn classpath(&self) -> Option<&str>;
    fn set_classpath(&mut self, classpath: impl Into<String>);
}

impl FieldsExt for Fields {
    fn id(&self) -> Option<&str> {
        self.get(ID).and_then(Value::as_str)
    }

    fn set_id(&mut self, id: impl Into<String>) {
        self.insert(ID.to_string(), Value::String(id.into()));
    }

    fn count(&self) -> i64 {
        self.get(COUNT).and_then(Value::as_i64).unwrap_or(0)
    }

    fn set_count(&mut self, count: i64) {
        self.insert(COUNT.to_string(), Value::Int(count));
    }

    fn classpath(&self) -> Option<&str> {
        self.get(CLASSPATH).and_then(Value::as_str)
    }

    fn set_classpath(&mut self, classpath: impl Into<String>) {
        self.insert(CLASSPATH.to_string(), Value::String(classpath.into()));
    }
}
