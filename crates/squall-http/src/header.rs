//! Ordered, case-insensitive header storage.
//!
//! Headers preserve insertion order and allow duplicates (multiple
//! `Set-Cookie` entries). Lookup is ASCII case-insensitive. The map also
//! converts to and from the byte-pair form used on the transport boundary.

/// An HTTP header as a name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered collection of HTTP headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a header, keeping any existing entries with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header::new(name, value));
    }

    /// Replace all entries with `name` by a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|h| !h.name.eq_ignore_ascii_case(&name));
        self.entries.push(Header::new(name, value));
    }

    /// Insert only if no entry with `name` exists yet.
    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if self.get(name).is_none() {
            self.insert(name, value);
        }
    }

    /// Remove all entries with `name` (case-insensitive).
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// First value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values for `name` (case-insensitive), in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every entry of `other`.
    pub fn extend(&mut self, other: &HeaderMap) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Encode to the transport's byte-pair form: lowercased names,
    /// latin-1 values as raw bytes, insertion order preserved.
    pub fn encode(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase().into_bytes(),
                    h.value.as_bytes().to_vec(),
                )
            })
            .collect()
    }

    /// Decode from the transport's byte-pair form. Non-UTF-8 names or
    /// values are decoded lossily; header names arrive lowercased and are
    /// kept as-is.
    pub fn from_byte_pairs(pairs: &[(Vec<u8>, Vec<u8>)]) -> Self {
        let mut map = Self::new();
        for (name, value) in pairs {
            map.insert(
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            );
        }
        map
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, v)| Header::new(n, v)).collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, v)| Header::new(n, v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_case_insensitive_get() {
        let mut map = HeaderMap::new();
        map.insert("Content-Type", "text/html");
        assert_eq!(map.get("content-type"), Some("text/html"));
        assert_eq!(map.get("CONTENT-TYPE"), Some("text/html"));
        assert_eq!(map.get("X-Missing"), None);
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut map = HeaderMap::new();
        map.insert("Set-Cookie", "a=1");
        map.insert("Set-Cookie", "b=2");
        assert_eq!(map.get_all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(map.get("set-cookie"), Some("a=1"));
    }

    #[test]
    fn set_replaces_all_duplicates() {
        let mut map = HeaderMap::new();
        map.insert("X-A", "1");
        map.insert("x-a", "2");
        map.set("X-A", "3");
        assert_eq!(map.get_all("x-a"), vec!["3"]);
    }

    #[test]
    fn set_default_only_fills_gaps() {
        let mut map = HeaderMap::new();
        map.set_default("Host", "fallback");
        assert_eq!(map.get("host"), Some("fallback"));
        map.set_default("Host", "other");
        assert_eq!(map.get("host"), Some("fallback"));
    }

    #[test]
    fn remove_is_case_insensitive() {
        let mut map = HeaderMap::new();
        map.insert("X-Token", "abc");
        map.remove("x-token");
        assert!(map.is_empty());
    }

    #[test]
    fn encode_lowercases_names() {
        let mut map = HeaderMap::new();
        map.insert("Content-Type", "application/json");
        let encoded = map.encode();
        assert_eq!(encoded[0].0, b"content-type".to_vec());
        assert_eq!(encoded[0].1, b"application/json".to_vec());
    }

    #[test]
    fn byte_pair_roundtrip() {
        let pairs = vec![
            (b"host".to_vec(), b"example.com".to_vec()),
            (b"accept".to_vec(), b"*/*".to_vec()),
        ];
        let map = HeaderMap::from_byte_pairs(&pairs);
        assert_eq!(map.get("Host"), Some("example.com"));
        assert_eq!(map.encode(), pairs);
    }
}
