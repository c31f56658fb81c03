//! HTTP transport types for the injected-connection pattern.
//!
//! # Design
//! These types describe requests and responses as plain data. The core crate
//! prepares requests and materializes `RawResponse` values without ever
//! opening a socket; a host-supplied `Connection` performs the actual I/O.
//! All fields use owned types so values can move freely between the calling
//! thread and batch workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Sent with every request so HAL-aware servers can embed associations.
pub const ACCEPT_HEADER_VALUE: &str = "application/hal+json, application/json;q=0.5";

/// Headers that keep every value instead of overwriting the previous one.
const MULTI_VALUE_HEADERS: &[&str] = &["set-cookie"];

/// HTTP method for a mapped call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            _ => Err(ApiError::InvalidRequestMethod(s.to_string())),
        }
    }
}

/// A header value: most headers hold one, `Set-Cookie` accumulates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// The first (or only) value.
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::Single(v) => v,
            HeaderValue::Multiple(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderValue::Single(v) => vec![v.as_str()],
            HeaderValue::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Single(v) => f.write_str(v),
            HeaderValue::Multiple(values) => write!(f, "{values:?}"),
        }
    }
}

/// Ordered, case-insensitive header multimap.
///
/// The spelling used the first time a name is set is the one kept for
/// iteration. Setting a header again replaces its value unless the header is
/// one that legitimately repeats (`Set-Cookie`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderList {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let multi = MULTI_VALUE_HEADERS.contains(&name.to_ascii_lowercase().as_str());
        match self.position(&name) {
            Some(idx) if multi => {
                let slot = &mut self.entries[idx].1;
                match slot {
                    HeaderValue::Multiple(values) => values.push(value),
                    HeaderValue::Single(existing) => {
                        *slot = HeaderValue::Multiple(vec![existing.clone(), value]);
                    }
                }
            }
            Some(idx) => self.entries[idx].1 = HeaderValue::Single(value),
            None if multi => self.entries.push((name, HeaderValue::Multiple(vec![value]))),
            None => self.entries.push((name, HeaderValue::Single(value))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.position(name).map(|idx| &self.entries[idx].1)
    }

    /// Shorthand for the first value of `name`.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).map(HeaderValue::first)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries whole; multi-value headers yield their full list.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate one `(name, value)` pair per value.
    pub fn iter_split(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, v)| v.values().into_iter().map(move |value| (k.as_str(), value)))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut list = HeaderList::new();
        for (k, v) in iter {
            list.set(k, v);
        }
        list
    }
}

/// An HTTP response described as plain data.
///
/// Produced by a `Connection` (or a fake/proxy handler) and consumed by the
/// materializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderList::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get_str("content-type")
    }

    /// Whether the content type names an XML media type, in any case.
    pub fn is_xml(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("xml"))
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get_str("etag")
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}
