//! Transport boundary and per-context connection routing.
//!
//! # Design
//! The core never opens sockets. Hosts implement `Connection` for one base
//! URL and hand the library a `ConnectionFactory`. A `ConnectionPool` keeps
//! one connection per base URL for the execution context that owns it; it is
//! deliberately `!Sync`, and batch workers build their own pool.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::{ApiError, TransportError};
use crate::http::{HeaderList, HttpMethod, RawResponse};
use crate::request::RequestContext;

/// One HTTP endpoint, bound to a base URL. Paths are relative to it.
pub trait Connection: Send + Sync {
    fn get(&self, path: &str, headers: &HeaderList) -> Result<RawResponse, TransportError>;
    fn post(&self, path: &str, body: &str, headers: &HeaderList) -> Result<RawResponse, TransportError>;
    fn put(&self, path: &str, body: &str, headers: &HeaderList) -> Result<RawResponse, TransportError>;
    fn delete(&self, path: &str, headers: &HeaderList) -> Result<RawResponse, TransportError>;
}

/// Creates a `Connection` for a base URL.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, base_url: &str) -> Arc<dyn Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(&str) -> Arc<dyn Connection> + Send + Sync,
{
    fn connect(&self, base_url: &str) -> Arc<dyn Connection> {
        self(base_url)
    }
}

/// Where a request goes: a pooled base URL and the path below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub base_url: String,
    pub path: String,
}

impl Route {
    pub fn full_url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    connections: RefCell<IndexMap<String, Arc<dyn Connection>>>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("base_urls", &self.connections.borrow().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            connections: RefCell::new(IndexMap::new()),
        }
    }

    /// A fresh, empty pool sharing this pool's factory.
    pub fn fork(&self) -> Self {
        Self::new(Arc::clone(&self.factory))
    }

    /// The pooled connection for `base_url`, created on first use.
    pub fn get_connection(&self, base_url: &str) -> Arc<dyn Connection> {
        let key = base_url.trim_end_matches('/');
        if let Some(conn) = self.connections.borrow().get(key) {
            return Arc::clone(conn);
        }
        debug!(base_url = key, "opening pooled connection");
        let conn = self.factory.connect(key);
        self.connections
            .borrow_mut()
            .insert(key.to_string(), Arc::clone(&conn));
        conn
    }

    /// Longest pooled base URL that prefixes `url` at a path boundary.
    pub fn find_connection_for_url(&self, url: &str) -> Option<(String, Arc<dyn Connection>)> {
        self.connections
            .borrow()
            .iter()
            .filter(|(base, _)| has_base(url, base))
            .max_by_key(|(base, _)| base.len())
            .map(|(base, conn)| (base.clone(), Arc::clone(conn)))
    }

    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }

    pub fn reset(&self) {
        self.connections.borrow_mut().clear();
    }

    fn reconnect(&self, base_url: &str) -> Arc<dyn Connection> {
        let conn = self.factory.connect(base_url);
        self.connections
            .borrow_mut()
            .insert(base_url.to_string(), Arc::clone(&conn));
        conn
    }

    /// Split `url` into a pooled base and a path.
    ///
    /// Relative URLs hang off `base_url`. Absolute URLs reuse the longest
    /// pooled (or declared) base that prefixes them, else get a connection to
    /// their own scheme, host and port.
    pub fn resolve(&self, resource: &str, base_url: Option<&str>, url: &str) -> Result<Route, ApiError> {
        let declared = base_url.map(|base| base.trim_end_matches('/'));
        if !is_absolute(url) {
            let base = declared.ok_or_else(|| ApiError::NoBaseUrl(resource.to_string()))?;
            return Ok(Route {
                base_url: base.to_string(),
                path: url.to_string(),
            });
        }

        let pooled = self.find_connection_for_url(url).map(|(base, _)| base);
        let prefixed = match (pooled, declared) {
            (Some(pooled), Some(declared)) if declared.len() > pooled.len() && has_base(url, declared) => {
                Some(declared.to_string())
            }
            (Some(pooled), _) => Some(pooled),
            (None, Some(declared)) if has_base(url, declared) => Some(declared.to_string()),
            _ => None,
        };
        if let Some(base) = prefixed {
            let rest = &url[base.len()..];
            let path = if rest.starts_with('?') {
                format!("/{rest}")
            } else if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            };
            return Ok(Route { base_url: base, path });
        }

        let parsed = url::Url::parse(url).map_err(|err| ApiError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Route {
            base_url: parsed.origin().ascii_serialization(),
            path,
        })
    }

    /// Send `ctx` over `route`, reconnecting and retrying once if the
    /// connection fails.
    pub fn send(&self, route: &Route, ctx: &RequestContext) -> Result<RawResponse, ApiError> {
        let conn = self.get_connection(&route.base_url);
        match perform(conn.as_ref(), route, ctx) {
            Err(TransportError::ConnectionFailed(url)) => {
                warn!(url = %url, "connection failed, reconnecting once");
                let conn = self.reconnect(&route.base_url);
                perform(conn.as_ref(), route, ctx).map_err(ApiError::from)
            }
            other => other.map_err(ApiError::from),
        }
    }
}

fn perform(conn: &dyn Connection, route: &Route, ctx: &RequestContext) -> Result<RawResponse, TransportError> {
    let body = ctx.body.as_deref().unwrap_or_default();
    match ctx.method {
        HttpMethod::Get => conn.get(&route.path, &ctx.headers),
        HttpMethod::Post => conn.post(&route.path, body, &ctx.headers),
        HttpMethod::Put => conn.put(&route.path, body, &ctx.headers),
        HttpMethod::Delete => conn.delete(&route.path, &ctx.headers),
    }
}

/// `url` starts with `base` and continues with a path, a query or nothing,
/// so `http://host` never claims `http://host:8080` or `http://host.evil`.
fn has_base(url: &str, base: &str) -> bool {
    url.strip_prefix(base)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
}

pub fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}


#[cfg(test)]
mod tests {
    use super::testing::StubTransport;
    use super::*;

    fn get_context(url: &str) -> RequestContext {
        let mut ctx = RequestContext::new("Person", "find", HttpMethod::Get);
        ctx.url = url.to_string();
        ctx
    }

    #[test]
    fn reuses_one_connection_per_base_url() {
        let stub = StubTransport::new();
        let pool = ConnectionPool::new(stub.factory());
        let first = pool.get_connection("http://www.example.com/");
        let second = pool.get_connection("http://www.example.com");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
        assert_eq!(stub.connects.lock().len(), 1);
    }

    #[test]
    fn finds_longest_prefix() {
        let stub = StubTransport::new();
        let pool = ConnectionPool::new(stub.factory());
        pool.get_connection("http://www.example.com");
        pool.get_connection("http://www.example.com/v2");
        let (base, _) = pool
            .find_connection_for_url("http://www.example.com/v2/people")
            .unwrap();
        assert_eq!(base, "http://www.example.com/v2");
        assert!(pool.find_connection_for_url("http://other.example.com/").is_none());
    }

    #[test]
    fn relative_urls_need_a_base() {
        let stub = StubTransport::new();
        let pool = ConnectionPool::new(stub.factory());
        let route = pool.resolve("Person", Some("http://www.example.com/"), "/people/1").unwrap();
        assert_eq!(route.full_url(), "http://www.example.com/people/1");
        assert!(matches!(
            pool.resolve("Person", None, "/people/1"),
            Err(ApiError::NoBaseUrl(ref name)) if name == "Person"
        ));
    }

    #[test]
    fn absolute_urls_reuse_matching_connections() {
        let stub = StubTransport::new();
        let pool = ConnectionPool::new(stub.factory());
        pool.get_connection("http://www.example.com/api");
        let route = pool
            .resolve("Person", None, "http://www.example.com/api/people?page=2")
            .unwrap();
        assert_eq!(route.base_url, "http://www.example.com/api");
        assert_eq!(route.path, "/people?page=2");
    }

    #[test]
    fn pooled_bases_only_match_at_a_path_boundary() {
        let stub = StubTransport::new();
        let pool = ConnectionPool::new(stub.factory());
        pool.get_connection("http://www.example.com");

        let route = pool
            .resolve("Person", None, "http://www.example.com:8080/people/1")
            .unwrap();
        assert_eq!(route.base_url, "http://www.example.com:8080");
        assert_eq!(route.path, "/people/1");

        let route = pool
            .resolve("Person", Some("http://www.example.com"), "http://www.example.com.evil.org/people/1")
            .unwrap();
        assert_eq!(route.base_url, "http://www.example.com.evil.org");
        assert_eq!(route.path, "/people/1");

        let route = pool.resolve("Person", None, "http://www.example.com?page=2").unwrap();
        assert_eq!(route.base_url, "http://www.example.com");
        assert_eq!(route.path, "/?page=2");
    }

    #[test]
    fn unknown_hosts_get_an_origin_connection() {
        let stub = StubTransport::new();
        let pool = ConnectionPool::new(stub.factory());
        let route = pool
            .resolve("Person", Some("http://www.example.com"), "https://cdn.example.org:8443/a/b?c=d")
            .unwrap();
        assert_eq!(route.base_url, "https://cdn.example.org:8443");
        assert_eq!(route.path, "/a/b?c=d");
    }

    #[test]
    fn retries_once_after_connection_failure() {
        let stub = StubTransport::new();
        stub.fail(TransportError::ConnectionFailed("http://www.example.com/".into()));
        stub.respond(RawResponse::new(200, "{}"));
        let pool = ConnectionPool::new(stub.factory());
        let route = pool.resolve("Person", Some("http://www.example.com"), "/").unwrap();
        let response = pool.send(&route, &get_context("/")).unwrap();
        assert_eq!(response.body, "{}");
        assert_eq!(stub.requests().len(), 2);
        assert_eq!(stub.connects.lock().len(), 2);
    }

    #[test]
    fn surfaces_second_connection_failure() {
        let stub = StubTransport::new();
        stub.fail(TransportError::ConnectionFailed("http://www.example.com/".into()));
        stub.fail(TransportError::ConnectionFailed("http://www.example.com/".into()));
        let pool = ConnectionPool::new(stub.factory());
        let route = pool.resolve("Person", Some("http://www.example.com"), "/").unwrap();
        let err = pool.send(&route, &get_context("/")).unwrap_err();
        assert!(matches!(err, ApiError::ConnectionFailed { .. }));
    }

    #[test]
    fn timeouts_are_not_retried() {
        let stub = StubTransport::new();
        stub.fail(TransportError::Timeout("http://www.example.com/".into()));
        let pool = ConnectionPool::new(stub.factory());
        let route = pool.resolve("Person", Some("http://www.example.com"), "/").unwrap();
        let err = pool.send(&route, &get_context("/")).unwrap_err();
        assert!(matches!(err, ApiError::Timeout { .. }));
        assert_eq!(stub.requests().len(), 1);
    }
}
