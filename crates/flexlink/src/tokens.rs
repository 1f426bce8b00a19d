//! `key=value` tokenizer shared by the LAN and relay parsers.
//!
//! Discovery payloads and relay control lines are ASCII text made of
//! whitespace-separated tokens. A token of the form `key=value` sets a
//! property; a bare token is a flag. Unknown keys are kept but ignored by
//! the parsers, which is what lets older code read newer firmware.

use std::collections::HashMap;
use std::net::IpAddr;

/// Properties parsed from one payload or line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: HashMap<String, String>,
    words: Vec<String>,
}

impl Properties {
    /// Tokenize `text`. For duplicate keys the last value wins.
    pub fn parse(text: &str) -> Self {
        let mut props = Properties::default();
        for token in text.split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) => {
                    props.values.insert(key.to_string(), value.to_string());
                }
                None => props.words.push(token.to_string()),
            }
        }
        props
    }

    /// Tokenize a raw payload, ignoring trailing NUL padding. Bytes that are
    /// not valid UTF-8 are replaced rather than rejected.
    pub fn from_payload(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        Self::parse(text.trim_matches('\0'))
    }

    /// The value of `key`, if present with `=value`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The value of `key` or an empty string.
    pub fn string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// The first present, non-empty value among `keys`.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.get(k))
            .find(|v| !v.is_empty())
    }

    pub fn u16(&self, key: &str) -> Option<u16> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn ip(&self, key: &str) -> Option<IpAddr> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// A port value where `-1` (or anything unparseable) means "none".
    pub fn port(&self, key: &str) -> Option<u16> {
        self.get(key)
            .and_then(|v| v.parse::<i32>().ok())
            .and_then(|p| u16::try_from(p).ok())
            .filter(|&p| p != 0)
    }

    /// Boolean value: `1`/`true`/`yes` as a value, or a bare flag.
    pub fn bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            None => self.has_flag(key),
        }
    }

    /// Whether `word` appeared as a bare token.
    pub fn has_flag(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }

    /// Bare tokens in the order they appeared.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// A comma-separated list value. Missing or empty keys yield an empty
    /// list.
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(v) if !v.is_empty() => v.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }

    /// Number of `key=value` pairs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.words.is_empty()
    }
}

/// Undo the radio's escaping of spaces in free-text values (`0x7F`).
pub fn unescape_spaces(value: &str) -> String {
    value.replace('\u{7f}', " ")
}
