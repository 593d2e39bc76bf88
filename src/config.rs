//! Engine configuration.

use std::collections::HashMap;

/// Flat key/value configuration consumed by the engine and its transport.
///
/// Well-known keys: `host`, `port`, `branch`, `key`, `device_type_id`,
/// `device_id`, `secret` (endpoint and credentials), `lang`, `codec`, `vt`
/// (request defaults) and `op_timeout_ms` (response deadline). Unknown keys
/// are kept and ignored.
#[derive(Debug, Clone, Default)]
pub struct SpeechConfig {
    entries: HashMap<String, String>,
}

impl SpeechConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Look up `key`, falling back to `default` when unset.
    pub fn get<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.entries.get(key).map(String::as_str).unwrap_or(default)
    }

    /// Look up `key` as an unsigned integer. Unset or malformed values
    /// yield `None`.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.entries.get(key)?.parse().ok()
    }
}
