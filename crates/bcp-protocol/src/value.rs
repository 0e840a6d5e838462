//! Typed parameter values.
//!
//! Every BCP parameter is one of a small set of scalar types (string,
//! integer, float, boolean, null) or a nested collection. Scalars travel in
//! the short `k=tag:v` wire form; any collection forces the whole parameter
//! map into the `json=` wire form.

use std::collections::BTreeMap;
use std::fmt;

/// An ordered command parameter map. Keys are lowercased on decode.
pub type ParamMap = BTreeMap<String, Value>;

/// A single BCP parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// True for values that cannot be expressed in the short wire form.
    pub fn is_composite(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Borrow the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer view. Accepts `Int` directly and decimal strings, since
    /// peers are free to send `state=1` instead of `state=int:1`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::from(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect(),
            ),
        }
    }
}

/// Plain-text rendering, used for template substitution. Booleans and null
/// render in the protocol's spelling (`True`, `False`, `None`).
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            composite => write!(f, "{}", composite.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

/// Convert a parameter map to a JSON object for the `json=` wire form.
pub(crate) fn params_to_json(params: &ParamMap) -> serde_json::Value {
    serde_json::Value::Object(
        params.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
    )
}

/// Convert a decoded JSON object back into a parameter map. Keys are kept
/// as-is; the `json=` branch does not lowercase (matches the wire).
pub(crate) fn params_from_json(object: serde_json::Map<String, serde_json::Value>) -> ParamMap {
    object.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect()
}
