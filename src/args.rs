//! Query-string and form-body argument maps.
//!
//! A key can appear once (a single value) or repeated (an ordered list).
//! Every source is capped at [`MAX_ARGS`] entries regardless of how many
//! `key=value` pairs the input actually contains, as cheap insurance
//! against hash-flooding a single request's argument map.

use std::collections::HashMap;

use crate::error::{Result, ServerError};

/// Hard cap on key/value pairs parsed out of one query string or form body.
pub const MAX_ARGS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Single(String),
    Multi(Vec<String>),
}

impl ArgValue {
    pub fn first(&self) -> &str {
        match self {
            ArgValue::Single(s) => s,
            ArgValue::Multi(v) => v.first().map(|s| s.as_str()).unwrap_or(""),
        }
    }

    pub fn all(&self) -> Vec<&str> {
        match self {
            ArgValue::Single(s) => vec![s.as_str()],
            ArgValue::Multi(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments(HashMap<String, ArgValue>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.first())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }

    fn insert(&mut self, key: String, value: String) -> Result<()> {
        self.insert_value(key, value);
        Ok(())
    }

    /// Inserts one key/value pair, folding a repeated key into `Multi`.
    /// Silently drops a brand new key once [`MAX_ARGS`] distinct keys are
    /// already present in *this* map; repeated values for an existing key
    /// are still accepted since they don't grow the key count. Use this
    /// only within a single source (one query string or one form body) —
    /// merging a second, independently-capped source should go through
    /// [`Arguments::merge_from`] instead, so the two sources' caps don't
    /// compound into one combined 256 limit.
    pub fn insert_value(&mut self, key: String, value: String) {
        if !self.0.contains_key(&key) && self.0.len() >= MAX_ARGS {
            return;
        }
        match self.0.get_mut(&key) {
            None => {
                self.0.insert(key, ArgValue::Single(value));
            }
            Some(ArgValue::Single(existing)) => {
                let prev = std::mem::take(existing);
                self.0.insert(key, ArgValue::Multi(vec![prev, value]));
            }
            Some(ArgValue::Multi(values)) => values.push(value),
        }
    }

    /// Folds `other` — already capped at [`MAX_ARGS`] on its own source —
    /// into `self` without re-checking the combined key count. §3's cap is
    /// per source (query string or form body), not per request, so a query
    /// string at the cap plus a form body with one more distinct key must
    /// keep both, not silently drop the form key.
    pub fn merge_from(&mut self, other: Arguments) {
        for (key, value) in other.0 {
            match self.0.remove(&key) {
                None => {
                    self.0.insert(key, value);
                }
                Some(existing) => {
                    self.0.insert(key, merge_values(existing, value));
                }
            }
        }
    }
}

fn merge_values(a: ArgValue, b: ArgValue) -> ArgValue {
    let mut values = match a {
        ArgValue::Single(s) => vec![s],
        ArgValue::Multi(v) => v,
    };
    match b {
        ArgValue::Single(s) => values.push(s),
        ArgValue::Multi(v) => values.extend(v),
    }
    ArgValue::Multi(values)
}

/// Parses a `key=value&key2=value2` grammar shared by query strings and
/// `application/x-www-form-urlencoded` bodies. `+` decodes to space and
/// `%HH` decodes to the corresponding byte.
pub fn parse_www_form(input: &str) -> Result<Arguments> {
    let mut args = Arguments::new();
    if input.is_empty() {
        return Ok(args);
    }
    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_val) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = percent_decode_form(raw_key)?;
        let val = percent_decode_form(raw_val)?;
        args.insert(key, val)?;
    }
    Ok(args)
}

/// Percent-decodes a `+`-as-space form component.
fn percent_decode_form(input: &str) -> Result<String> {
    percent_decode_bytes(input.as_bytes(), true)
}

/// Percent-decodes a byte string with no `+` substitution (e.g. path
/// segments). Rejects non-hex digits with `MalformedEncoding`.
pub fn percent_decode(input: &str) -> Result<String> {
    percent_decode_bytes(input.as_bytes(), false)
}

fn percent_decode_bytes(input: &[u8], plus_as_space: bool) -> Result<String> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hi = input
                    .get(i + 1)
                    .and_then(|b| (*b as char).to_digit(16))
                    .ok_or(ServerError::MalformedEncoding)?;
                let lo = input
                    .get(i + 2)
                    .and_then(|b| (*b as char).to_digit(16))
                    .ok_or(ServerError::MalformedEncoding)?;
                out.push(((hi << 4) | lo) as u8);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Percent-encodes `input`, escaping everything except unreserved
/// characters. Used only by tests to exercise the decode round trip —
/// the core never synthesizes URLs itself.
#[cfg(test)]
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plus_and_percent() {
        let args = parse_www_form("a=1&b=hello+world&c=%2F").unwrap();
        assert_eq!(args.get_first("a"), Some("1"));
        assert_eq!(args.get_first("b"), Some("hello world"));
        assert_eq!(args.get_first("c"), Some("/"));
    }

    #[test]
    fn repeated_key_becomes_multi() {
        let args = parse_www_form("a=1&b=2&a=3").unwrap();
        match args.get("a").unwrap() {
            ArgValue::Multi(v) => assert_eq!(v, &vec!["1".to_string(), "3".to_string()]),
            other => panic!("expected Multi, got {other:?}"),
        }
        assert_eq!(args.get_first("b"), Some("2"));
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            parse_www_form("a=%zz"),
            Err(ServerError::MalformedEncoding)
        ));
    }

    #[test]
    fn caps_at_max_args() {
        let input: String = (0..MAX_ARGS + 50)
            .map(|i| format!("k{i}=v"))
            .collect::<Vec<_>>()
            .join("&");
        let args = parse_www_form(&input).unwrap();
        assert_eq!(args.len(), MAX_ARGS);
    }

    /// §3's cap is per source: a query string at the cap merged with a
    /// form body carrying one new key must keep both, not drop the
    /// form key because the combined count would exceed 256.
    #[test]
    fn merge_from_does_not_apply_a_combined_cap() {
        let query_input: String = (0..MAX_ARGS)
            .map(|i| format!("k{i}=v"))
            .collect::<Vec<_>>()
            .join("&");
        let mut query_args = parse_www_form(&query_input).unwrap();
        assert_eq!(query_args.len(), MAX_ARGS);

        let form_args = parse_www_form("b1=1").unwrap();
        query_args.merge_from(form_args);

        assert_eq!(query_args.len(), MAX_ARGS + 1);
        assert_eq!(query_args.get_first("b1"), Some("1"));
    }

    #[test]
    fn percent_decode_round_trip() {
        for s in ["hello world", "a/b?c=d&e", "", "日本語", "100%"] {
            let encoded = percent_encode(s);
            let decoded = percent_decode(&encoded).unwrap();
            assert_eq!(decoded, s);
        }
    }
}
