//! Mutable request/response metadata.
//!
//! Headers are a string-keyed map of structured values. Writers may ask for a
//! value to be checked against, or converted to, an expected [`ValueKind`];
//! a missing value with an expected kind becomes that kind's zero value.

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Header key carrying the response status code.
pub const STATUS_CODE: &str = "status_code";

/// Header key carrying the response status message.
pub const STATUS: &str = "status";

/// Errors raised while validating header values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Value has the wrong type and could not be converted.
    #[error("header '{key}' must be of type {expected}")]
    Type {
        /// Offending key.
        key: String,
        /// Human readable list of accepted kinds.
        expected: String,
    },

    /// A map used as a string dictionary had a non-string key.
    #[error("dictionary keys must be strings, got {found}")]
    NonStringKey {
        /// Kind of the offending key.
        found: &'static str,
    },

    /// A value expected to be a map was something else.
    #[error("expected a map, got {found}")]
    NotAMap {
        /// Kind of the value received.
        found: &'static str,
    },
}

/// Kinds of values a header may be constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
}

impl ValueKind {
    /// Name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        }
    }

    /// Value used when `None` is stored under this kind.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::from(0),
            ValueKind::Float => Value::from(0.0),
            ValueKind::Str => Value::String(String::new()),
            ValueKind::List => Value::Array(Vec::new()),
            ValueKind::Map => Value::Object(Map::new()),
        }
    }

    /// Whether `value` already is of this kind.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Int => value.is_i64() || value.is_u64(),
            ValueKind::Float => value.is_f64(),
            ValueKind::Str => value.is_string(),
            ValueKind::List => value.is_array(),
            ValueKind::Map => value.is_object(),
        }
    }

    /// Converts `value` to this kind when a lossless-enough conversion exists.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        if self.matches(value) {
            return Some(value.clone());
        }
        match (self, value) {
            (ValueKind::Bool, Value::Number(n)) => Some(Value::Bool(n.as_f64()? != 0.0)),
            (ValueKind::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" | "" => Some(Value::Bool(false)),
                _ => None,
            },
            (ValueKind::Int, Value::Bool(b)) => Some(Value::from(*b as i64)),
            (ValueKind::Int, Value::Number(n)) => {
                let f = n.as_f64()?;
                f.is_finite().then(|| Value::from(f.trunc() as i64))
            }
            (ValueKind::Int, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (ValueKind::Float, Value::Bool(b)) => Some(Value::from(if *b { 1.0 } else { 0.0 })),
            (ValueKind::Float, Value::Number(n)) => {
                n.as_f64().and_then(Number::from_f64).map(Value::Number)
            }
            (ValueKind::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            (ValueKind::Str, Value::String(_)) => Some(value.clone()),
            (ValueKind::Str, Value::Null) => None,
            (ValueKind::Str, other) => Some(Value::String(other.to_string())),
            _ => None,
        }
    }
}

/// Describes what a header value must look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expect {
    kinds: Vec<ValueKind>,
    index: usize,
    convert: bool,
}

impl Expect {
    /// A single accepted kind, converting when possible.
    pub fn kind(kind: ValueKind) -> Self {
        Self {
            kinds: vec![kind],
            index: 0,
            convert: true,
        }
    }

    /// Several accepted kinds; `index` selects the one used for zero values and conversion.
    pub fn any_of(kinds: &[ValueKind], index: usize) -> Self {
        Self {
            kinds: kinds.to_vec(),
            index: index.min(kinds.len().saturating_sub(1)),
            convert: true,
        }
    }

    /// Reject values of the wrong kind instead of converting them.
    pub fn strict(mut self) -> Self {
        self.convert = false;
        self
    }

    fn default_kind(&self) -> Option<ValueKind> {
        self.kinds.get(self.index).copied()
    }

    fn describe(&self) -> String {
        self.kinds
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(" or ")
    }

    /// Validates `value` for `key`, returning the value to store.
    pub fn check(&self, key: &str, value: Value) -> Result<Value, HeaderError> {
        let Some(default_kind) = self.default_kind() else {
            return Ok(value);
        };
        if value.is_null() {
            return Ok(default_kind.zero());
        }
        if self.kinds.iter().any(|k| k.matches(&value)) {
            return Ok(value);
        }
        let converted = if self.convert {
            default_kind.coerce(&value)
        } else {
            None
        };
        converted.ok_or_else(|| HeaderError::Type {
            key: key.to_string(),
            expected: self.describe(),
        })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// A dictionary whose keys are guaranteed to be strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrDict(Map<String, Value>);

impl StrDict {
    /// Empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dictionary from arbitrary key/value pairs, rejecting non-string keys.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, HeaderError>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let mut map = Map::new();
        for (key, value) in pairs {
            match key {
                Value::String(key) => {
                    map.insert(key, value);
                }
                other => {
                    return Err(HeaderError::NonStringKey {
                        found: kind_of(&other),
                    })
                }
            }
        }
        Ok(Self(map))
    }

    /// Accepts a map value; `null` yields an empty dictionary.
    pub fn from_value(value: Value) -> Result<Self, HeaderError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(HeaderError::NotAMap {
                found: kind_of(&other),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Appends `value` under `key` (see [`append_value`]).
    pub fn append(&mut self, key: &str, value: Value) {
        append_value(&mut self.0, key, value);
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// Appends to a list stored under `key`.
///
/// A missing key becomes a one-element list; an existing scalar is turned
/// into a list holding the old value followed by the new one(s).
pub fn append_value(map: &mut Map<String, Value>, key: &str, value: Value) {
    match map.get_mut(key) {
        None => {
            map.insert(key.to_string(), Value::Array(vec![value]));
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let old = existing.take();
            let mut items = vec![old];
            match value {
                Value::Array(more) => items.extend(more),
                single => items.push(single),
            }
            *existing = Value::Array(items);
        }
    }
}

/// A bag of headers with typed setters and status helpers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    map: Map<String, Value>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a decoded header map.
    pub fn from_value(value: Value) -> Result<Self, HeaderError> {
        Ok(Self {
            map: StrDict::from_value(value)?.into_map(),
        })
    }

    /// Stores `value` without validation.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.map.insert(key.to_string(), value.into());
    }

    /// Stores `value` after checking it against `expect`.
    pub fn set_typed(
        &mut self,
        key: &str,
        value: Value,
        expect: &Expect,
    ) -> Result<(), HeaderError> {
        let value = expect.check(key, value)?;
        self.map.insert(key.to_string(), value);
        Ok(())
    }

    /// Appends `value` to the list under `key`.
    pub fn add(
        &mut self,
        key: &str,
        value: Value,
        expect: Option<&Expect>,
    ) -> Result<(), HeaderError> {
        let value = match expect {
            Some(expect) => expect.check(key, value)?,
            None => value,
        };
        append_value(&mut self.map, key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.map.get(key).and_then(Value::as_bool)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.map.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Copies every entry of `other` over this bag.
    pub fn extend(&mut self, other: &Headers) {
        for (key, value) in &other.map {
            self.map.insert(key.clone(), value.clone());
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.map.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.map.iter()
    }

    // Status helpers

    pub fn set_status_code(&mut self, code: i64) {
        self.set(STATUS_CODE, code);
    }

    pub fn set_status(&mut self, message: impl Into<String>) {
        self.set(STATUS, message.into());
    }

    /// Sets code and message together.
    pub fn set_status_pair(&mut self, code: i64, message: impl Into<String>) {
        self.set_status_code(code);
        self.set_status(message);
    }

    /// Status code, zero when unset.
    pub fn status_code(&self) -> i64 {
        self.map.get(STATUS_CODE).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn status(&self) -> Option<&str> {
        self.get_str(STATUS)
    }

    /// Clears status back to success.
    pub fn reset_status(&mut self) {
        self.set_status_code(0);
        self.map.remove(STATUS);
    }
}
