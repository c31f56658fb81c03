//! Declarative REST resource client core.
//!
//! # Overview
//! Callers declare resource types (base URL, named endpoints with URL
//! templates and options) in a `Registry`, then invoke those endpoints by
//! name through a `Client`. The client builds the request, consults the
//! ETag/Expires cache, dispatches through an optional proxy and a host-supplied
//! `Connection`, and materializes JSON, HAL or XML responses into dirty-tracked
//! `ResourceObject` graphs with lazily loaded associations.
//!
//! # Design
//! - The library never opens sockets: hosts implement `Connection` and hand
//!   in a `ConnectionFactory`. Tests drive it with in-memory stubs.
//! - Declarations are immutable once the `Registry` is built; configuration
//!   is composed once per type, not looked up per call.
//! - A `Client` is one execution context. It owns its connection pool and
//!   instrumentation counters and is not shared across threads.
//! - HTTP failures are typed (`ApiError::NotFound`, `ServerError`, ...) and
//!   carry the materialized error body.

pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod lazy;
pub mod mapping;
mod materialize;
pub mod proxy;
pub mod request;
pub mod resource;
pub mod result_iterator;
pub mod validation;
pub mod value;
pub mod xml;

pub use batch::{Batch, Deferred};
pub use cache::{CacheStore, CachedResponse, MemoryCacheStore};
pub use client::{CallResult, Client, Instrumentation};
pub use config::{BodyEncoding, ClientDefaults};
pub use connection::{Connection, ConnectionFactory, ConnectionPool};
pub use error::{ApiError, HttpFailure, TransportError};
pub use http::{HeaderList, HttpMethod, RawResponse};
pub use lazy::{LazyAssociationLoader, LazyCall};
pub use mapping::{CallOptions, Registry, ResourceType};
pub use proxy::{Proxy, ProxyRequest, Translator};
pub use request::{Params, RequestContext};
pub use resource::ResourceObject;
pub use result_iterator::ResultIterator;
pub use validation::Rule;
pub use value::{Timestamp, Value};
