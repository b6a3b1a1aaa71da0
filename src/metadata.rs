//! gRPC metadata: an ordered mapping from header name to a list of string or
//! opaque-binary values (§3), cloneable and serializable to/from wire
//! headers. Wraps `http::HeaderMap` and distinguishes ASCII values from
//! binary (`-bin` suffixed) ones.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use http::{
    header::{HeaderMap, HeaderName, HeaderValue},
    HeaderMap as HttpHeaderMap,
};
use std::str::FromStr;

const BIN_SUFFIX: &str = "-bin";

/// A metadata value: either a UTF-8 string (an ASCII header) or opaque
/// binary data (a `*-bin` header, base64-encoded on the wire).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Binary(b) => Some(b),
            MetadataValue::Ascii(_) => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Ascii(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Ascii(s)
    }
}

/// An ordered multimap of metadata entries, preserving insertion order
/// within a key (§8: "Metadata -> HTTP/2 headers -> Metadata preserves
/// non-reserved entries and their order").
#[derive(Clone, Debug, Default)]
pub struct MetadataMap {
    headers: HeaderMap,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self {
            headers: HeaderMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            headers: HeaderMap::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        HeaderName::from_str(key)
            .map(|k| self.headers.contains_key(k))
            .unwrap_or(false)
    }

    /// Inserts a value, replacing any existing values for the key.
    pub fn insert(&mut self, key: &str, value: impl Into<MetadataValue>) {
        let Ok(name) = HeaderName::from_str(key) else {
            return;
        };
        let header_value = Self::encode(key, &value.into());
        self.headers.insert(name, header_value);
    }

    /// Appends a value, keeping any existing values for the key.
    pub fn append(&mut self, key: &str, value: impl Into<MetadataValue>) {
        let Ok(name) = HeaderName::from_str(key) else {
            return;
        };
        let header_value = Self::encode(key, &value.into());
        self.headers.append(name, header_value);
    }

    pub fn get(&self, key: &str) -> Option<MetadataValue> {
        self.headers.get(key).map(|v| Self::decode(key, v))
    }

    pub fn get_all(&self, key: &str) -> impl Iterator<Item = MetadataValue> + '_ {
        let key = key.to_string();
        self.headers
            .get_all(key.clone())
            .into_iter()
            .map(move |v| Self::decode(&key, v))
    }

    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        self.headers
            .remove(key)
            .map(|v| Self::decode(key, &v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, MetadataValue)> + '_ {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), Self::decode(name.as_str(), value)))
    }

    fn encode(key: &str, value: &MetadataValue) -> HeaderValue {
        match value {
            MetadataValue::Ascii(s) => {
                HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
            }
            MetadataValue::Binary(bytes) => {
                let encoded = STANDARD_NO_PAD.encode(bytes);
                debug_assert!(key.ends_with(BIN_SUFFIX), "binary keys must end in -bin");
                HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
            }
        }
    }

    fn decode(key: &str, value: &HeaderValue) -> MetadataValue {
        if key.ends_with(BIN_SUFFIX) {
            match STANDARD_NO_PAD.decode(value.as_bytes()) {
                Ok(bytes) => MetadataValue::Binary(bytes),
                Err(_) => MetadataValue::Binary(Vec::new()),
            }
        } else {
            MetadataValue::Ascii(value.to_str().unwrap_or_default().to_string())
        }
    }

    /// Construct from a set of already-decoded wire headers.
    pub fn from_headers(headers: HttpHeaderMap) -> Self {
        Self { headers }
    }

    /// Merge another map's entries in, keeping this map's insertion order
    /// for keys already present and appending new ones (used to fold
    /// trailers received after headers).
    pub fn merge(&mut self, other: MetadataMap) {
        for (name, value) in other.headers {
            if let Some(name) = name {
                self.headers.append(name, value);
            }
        }
    }

    /// Consume into raw wire headers, ready to hand to an HTTP/2 request or
    /// response builder.
    pub fn into_headers(self) -> HttpHeaderMap {
        self.headers
    }

    pub fn as_headers(&self) -> &HttpHeaderMap {
        &self.headers
    }
}
