use std::collections::HashMap;

use bytes::Bytes;

/// Order-preserving header store with case-insensitive lookup.
///
/// Headers are kept as an ordered list of `(name, value)` pairs exactly as
/// they arrived — name casing and duplicates included — plus an auxiliary
/// index from lower-cased name to the positions of every occurrence. The
/// proxy must re-emit what it read, so duplicates are never collapsed.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<(Bytes, Bytes)>,
    index: HashMap<Vec<u8>, Vec<usize>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: Bytes, value: Bytes) {
        let key = name.to_ascii_lowercase();
        self.index.entry(key).or_default().push(self.entries.len());
        self.entries.push((name, value));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        let key = name.to_ascii_lowercase();
        self.index
            .get(&key)
            .and_then(|positions| positions.first())
            .map(|&at| self.entries[at].1.as_ref())
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all(&self, name: &[u8]) -> Vec<&[u8]> {
        let key = name.to_ascii_lowercase();
        match self.index.get(&key) {
            Some(positions) => positions
                .iter()
                .map(|&at| self.entries[at].1.as_ref())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    /// True when any value for `name` contains `token` as a comma-separated
    /// element, compared case-insensitively. Used for `Transfer-Encoding:
    /// chunked` and `Connection: close` style checks.
    pub fn value_has_token(&self, name: &[u8], token: &[u8]) -> bool {
        let token = token.to_ascii_lowercase();
        self.get_all(name).iter().any(|value| {
            value
                .split(|&b| b == b',')
                .any(|part| trim_ascii(part).to_ascii_lowercase() == token)
        })
    }

    /// Remove every occurrence of `name`.
    pub fn remove(&mut self, name: &[u8]) {
        let key = name.to_ascii_lowercase();
        if self.index.remove(&key).is_none() {
            return;
        }
        self.entries
            .retain(|(n, _)| n.to_ascii_lowercase() != key);
        self.reindex();
    }

    /// Replace every occurrence of `name` with a single entry, appending if
    /// absent.
    pub fn set(&mut self, name: Bytes, value: Bytes) {
        self.remove(&name);
        self.add(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialise in insertion order: `Name: value\r\n` per entry.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            buf.extend_from_slice(name);
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (at, (name, _)) in self.entries.iter().enumerate() {
            self.index
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(at);
        }
    }
}

pub(crate) fn trim_ascii(raw: &[u8]) -> &[u8] {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|at| at + 1)
        .unwrap_or(start);
    &raw[start..end]
}
