//! The `meta` side-channel column: a flat JSON object serialized compactly
//! and ASCII-only so it survives any locale or terminal it passes through.

use log::debug;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("malformed metadata: {0}")]
pub struct MetaError(String);

/// Arbitrary key/value annotations attached to a message row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta(Map<String, Value>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict parse. Empty input is an empty map; anything that is not a JSON
    /// object is an error.
    pub fn parse(raw: &str) -> Result<Self, MetaError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(MetaError(format!("expected object, found {}", kind(&other)))),
            Err(e) => Err(MetaError(e.to_string())),
        }
    }

    /// Parse, treating malformed input as empty.
    pub fn parse_lenient(raw: &str) -> Self {
        match Self::parse(raw) {
            Ok(meta) => meta,
            Err(e) => {
                debug!("{}; treating as empty", e);
                Self::default()
            }
        }
    }

    /// Compact JSON with every non-ASCII character as a `\uXXXX` escape.
    pub fn encode(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let compact = serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string());
        ascii_escape(&compact)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer value, accepting numbers or numeric strings.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Float value, accepting numbers or numeric strings.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Copy every entry of `other` over this map.
    pub fn merge(&mut self, other: &Meta) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn channel_index(&self) -> Option<i64> {
        self.get_i64("channel_index")
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn ascii_escape(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut buf = [0u16; 2];
            for unit in ch.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}
