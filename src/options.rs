//! Option bags attached to speech sessions.

use serde_json::{Map, Value};

/// An ordered string-to-string mapping forwarded to the server as JSON.
///
/// Insertion order is preserved so the serialized form is deterministic.
/// Numeric values are carried as strings; the transport layer never
/// reinterprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    entries: Vec<(String, String)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`. An existing key is overwritten in place and
    /// keeps its original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Serialize to a JSON object with keys in insertion order.
    pub fn to_json_string(&self) -> String {
        let mut map = Map::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Value::Object(map).to_string()
    }
}

/// The two option bags attached to a voice session at start: framework
/// options steer the engine, skill options are opaque to it and forwarded
/// to the server untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub framework: Option<Options>,
    pub skill: Option<Options>,
}
