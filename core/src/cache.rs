//! ETag/Expires response caching.
//!
//! # Design
//! The library never owns cache storage: it talks to a `CacheStore` supplied
//! on the `Registry` and hands it `CachedResponse` values serialized to JSON
//! bytes. Entries are keyed by `"<Type>:<original URL>"`.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::CallResult;
use crate::http::RawResponse;

/// Key-value storage for cached responses. Implementations must tolerate
/// concurrent reads and writes.
pub trait CacheStore: Send + Sync {
    fn read(&self, key: &str) -> Option<Vec<u8>>;

    /// Store `value`; `ttl` is a hint the store may use for eviction.
    fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    /// Read `key`, or produce, store and return a fresh value.
    fn fetch(&self, key: &str, producer: &mut dyn FnMut() -> Vec<u8>) -> Vec<u8> {
        if let Some(value) = self.read(key) {
            return value;
        }
        let value = producer();
        self.write(key, value.clone(), None);
        value
    }
}

/// A bounded in-process LRU store.
pub struct MemoryCacheStore {
    entries: Mutex<LruCache<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryCacheStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN))
    }
}

impl CacheStore for MemoryCacheStore {
    fn read(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        let expired = match entries.peek(key) {
            Some((_, Some(deadline))) => *deadline <= Instant::now(),
            Some(_) => false,
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|(value, _)| value.clone())
    }

    fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let deadline = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries.lock().put(key.to_string(), (value, deadline));
    }
}

/// What gets stored for a cacheable response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub result: CallResult,
    pub etag: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

impl CachedResponse {
    /// Build an entry if `raw` carries an ETag or Expires header. Plain bodies
    /// are never cached.
    pub fn for_response(raw: &RawResponse, result: &CallResult) -> Option<Self> {
        if matches!(result, CallResult::Plain(_)) {
            return None;
        }
        let etag = raw.etag().map(str::to_string);
        let expires_header = raw.headers.get_str("expires");
        if etag.is_none() && expires_header.is_none() {
            return None;
        }
        Some(Self {
            status: raw.status,
            result: result.clone(),
            etag,
            expires: expires_header.and_then(parse_expires),
        })
    }

    /// True while a hard expiry lies in the future.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires > now)
    }

    fn ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires
            .and_then(|expires| (expires - now).to_std().ok())
    }
}

/// `Type:url`, where `url` already carries the sorted query string of a GET
/// (so pages of one listing cache separately) and predates proxy rewriting.
pub fn cache_key(resource: &str, original_url: &str) -> String {
    format!("{resource}:{original_url}")
}

/// Parse an HTTP-date; unparseable values mean "no hard expiry".
pub fn parse_expires(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = httpdate::parse_http_date(value) {
        return Some(DateTime::<Utc>::from(time));
    }
    match DateTime::parse_from_rfc2822(value) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(_) => {
            debug!(expires = value, "ignoring unparseable Expires header");
            None
        }
    }
}

pub(crate) fn read(store: &dyn CacheStore, key: &str) -> Option<CachedResponse> {
    let bytes = store.read(key)?;
    match serde_json::from_slice(&bytes) {
        Ok(entry) => Some(entry),
        Err(err) => {
            warn!(key, error = %err, "discarding unreadable cache entry");
            None
        }
    }
}

pub(crate) fn write(store: &dyn CacheStore, key: &str, entry: &CachedResponse) {
    match serde_json::to_vec(entry) {
        Ok(bytes) => {
            debug!(key, etag = ?entry.etag, expires = ?entry.expires, "writing cache entry");
            store.write(key, bytes, entry.ttl(Utc::now()));
        }
        Err(err) => warn!(key, error = %err, "unable to serialize cache entry"),
    }
}
