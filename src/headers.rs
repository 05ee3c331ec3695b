//! Case-insensitive header storage plus the parsed request-line fields.

use std::collections::HashMap;

use crate::args::Arguments;

/// Case-insensitive mapping from header name to the last value seen.
/// Multiple occurrences of the same header are joined with `", "` on
/// input, matching how most HTTP implementations fold repeated headers.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    values: HashMap<String, String>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.values.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.values.insert(key, value.to_string());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// True when `name`'s value contains `token` as a comma-separated,
    /// case-insensitive entry (e.g. `Connection: keep-alive, Upgrade`).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        match self.get(name) {
            Some(v) => v
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token)),
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The structured form of a parsed request line plus header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: String,
    pub version: String,
    pub headers: HeaderSet,
    pub query_args: Arguments,
}
