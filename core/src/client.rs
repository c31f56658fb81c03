//! The request executor.
//!
//! # Design
//! A `Client` is one execution context: it shares the immutable `Registry`
//! with every other client but owns its connection pool and its
//! instrumentation counters, so it is `Send` but not `Sync`. Spawn one
//! client per thread.
//!
//! Every invocation runs in three phases. `prepare` resolves parameters,
//! expands the URL, runs before-filters, encodes the body and consults the
//! cache; it may finish the call outright on a hard cache hit. `dispatch`
//! sends the request through the proxy (if any) and the connection pool; it
//! is the only phase that blocks, and the only one batches move to worker
//! threads. `complete` runs after-filters, the response recorder,
//! materialization, cache writes and status mapping.

use std::cell::Cell;
use std::fmt;
use std::ops::Index;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, info};

use crate::batch::Batch;
use crate::cache::{self, CachedResponse};
use crate::connection::{self, ConnectionFactory, ConnectionPool};
use crate::error::ApiError;
use crate::http::{HttpMethod, RawResponse, ACCEPT_HEADER_VALUE};
use crate::lazy::LazyCall;
use crate::mapping::{MappedCall, Registry, ResourceType};
use crate::materialize::Materializer;
use crate::request::{Params, RequestContext, JSON_CONTENT_TYPE};
use crate::resource::ResourceObject;
use crate::result_iterator::ResultIterator;
use crate::validation;
use crate::value::{self, Value};

/// What a call produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallResult {
    Object(ResourceObject),
    List(ResultIterator),
    /// Raw body of a `plain` call or a scalar payload.
    Plain(String),
}

impl CallResult {
    pub fn as_object(&self) -> Option<&ResourceObject> {
        match self {
            CallResult::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ResultIterator> {
        match self {
            CallResult::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_plain(&self) -> Option<&str> {
        match self {
            CallResult::Plain(body) => Some(body),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<ResourceObject> {
        match self {
            CallResult::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<ResultIterator> {
        match self {
            CallResult::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CallResult::Object(object) => object.status(),
            CallResult::List(list) => list.status(),
            CallResult::Plain(_) => None,
        }
    }
}

impl Index<&str> for CallResult {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        match self {
            CallResult::Object(object) => &object[key],
            _ => value::null(),
        }
    }
}

impl Index<usize> for CallResult {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        match self {
            CallResult::List(list) => &list[idx],
            _ => value::null(),
        }
    }
}

/// Per-context call counters.
#[derive(Debug, Default)]
pub struct Instrumentation {
    calls_made: Cell<u64>,
    time_spent: Cell<Duration>,
}

impl Instrumentation {
    pub fn calls_made(&self) -> u64 {
        self.calls_made.get()
    }

    pub fn time_spent(&self) -> Duration {
        self.time_spent.get()
    }

    pub fn reset(&self) {
        self.calls_made.set(0);
        self.time_spent.set(Duration::ZERO);
    }

    fn record(&self, resource: &str, call: &str, elapsed: Duration) {
        self.calls_made.set(self.calls_made.get() + 1);
        self.time_spent.set(self.time_spent.get() + elapsed);
        debug!(
            "{resource}#{call} ({:.1}ms)",
            elapsed.as_secs_f64() * 1000.0
        );
    }
}

/// A request that is ready to go over the wire.
pub(crate) struct Prepared {
    resource: Arc<ResourceType>,
    call: Arc<MappedCall>,
    ctx: RequestContext,
    /// Full URL, for errors, logs and the response recorder.
    url: String,
    cache_key: Option<String>,
    cached: Option<CachedResponse>,
    fake: Option<RawResponse>,
    started: Instant,
}

pub(crate) enum Stage {
    Ready(CallResult),
    Pending(Box<Prepared>),
}

pub struct Client {
    registry: Arc<Registry>,
    pool: ConnectionPool,
    instrumentation: Instrumentation,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("instrumentation", &self.instrumentation)
            .finish()
    }
}

impl Client {
    pub fn new(registry: Arc<Registry>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            registry,
            pool: ConnectionPool::new(factory),
            instrumentation: Instrumentation::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    /// Invoke mapped call `call` of `resource` with `params`.
    pub fn call(&self, resource: &str, call: &str, params: Params) -> Result<CallResult, ApiError> {
        let resource = Arc::clone(self.registry.resource(resource)?);
        let mapped = Arc::clone(resource.mapped_call(call)?);
        self.run(resource, mapped, None, params)
    }

    /// Invoke `call` on an existing instance. Its attributes are the base
    /// parameters, validations run first, and an object result replaces the
    /// instance's state in place. On error the instance is left untouched.
    pub fn call_on(
        &self,
        target: &mut ResourceObject,
        call: &str,
        params: Params,
    ) -> Result<CallResult, ApiError> {
        let resource = Arc::clone(self.registry.resource(target.type_name())?);
        let mapped = Arc::clone(resource.mapped_call(call)?);
        let result = self.run(resource, mapped, Some(target), params)?;
        match result {
            CallResult::Object(fresh) => {
                target.replace_from(fresh);
                Ok(CallResult::Object(target.clone()))
            }
            other => Ok(other),
        }
    }

    /// Call an arbitrary URL (absolute, or relative to the type's base URL)
    /// with the type's filters, proxy and caching.
    pub fn request(
        &self,
        resource: &str,
        url: &str,
        method: HttpMethod,
        params: Params,
    ) -> Result<CallResult, ApiError> {
        let resource = Arc::clone(self.registry.resource(resource)?);
        let mapped = Arc::new(MappedCall::direct(method, url, false));
        self.run(resource, mapped, None, params)
    }

    /// Like `request`, but the body comes back untouched.
    pub fn plain_request(
        &self,
        resource: &str,
        url: &str,
        method: HttpMethod,
        params: Params,
    ) -> Result<String, ApiError> {
        let resource = Arc::clone(self.registry.resource(resource)?);
        let mapped = Arc::new(MappedCall::direct(method, url, true));
        match self.run(resource, mapped, None, params)? {
            CallResult::Plain(body) => Ok(body),
            CallResult::Object(object) => Ok(object.to_json().to_string()),
            CallResult::List(list) => {
                let items: Vec<_> = list.iter().map(Value::to_json).collect();
                Ok(serde_json::to_string(&items)?)
            }
        }
    }

    /// Defer a mapped call until `LazyCall::get` is first invoked.
    pub fn lazy_call(&self, resource: &str, call: &str, params: Params) -> LazyCall {
        LazyCall::mapped(resource, call, params)
    }

    /// Defer a direct request until first use.
    pub fn lazy_request(&self, resource: &str, url: &str, method: HttpMethod, params: Params) -> LazyCall {
        LazyCall::direct(resource, url, method, params)
    }

    /// Issue calls through a `Batch`; their transport dispatches run
    /// concurrently once `f` returns, and every placeholder is filled before
    /// this returns.
    pub fn in_parallel<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Batch<'_>) -> R,
    {
        let mut batch = Batch::new(self);
        let output = f(&mut batch);
        batch.drain();
        output
    }

    fn run(
        &self,
        resource: Arc<ResourceType>,
        call: Arc<MappedCall>,
        target: Option<&ResourceObject>,
        params: Params,
    ) -> Result<CallResult, ApiError> {
        let span = debug_span!("api_call", resource = resource.name(), call = %call.name);
        let _entered = span.enter();
        match self.prepare(resource, call, target, params)? {
            Stage::Ready(result) => Ok(result),
            Stage::Pending(prepared) => {
                let outcome = Self::dispatch(&self.pool, &prepared);
                self.complete(*prepared, outcome)
            }
        }
    }

    pub(crate) fn prepare_named(&self, resource: &str, call: &str, params: Params) -> Result<Stage, ApiError> {
        let resource = Arc::clone(self.registry.resource(resource)?);
        let mapped = Arc::clone(resource.mapped_call(call)?);
        self.prepare(resource, mapped, None, params)
    }

    pub(crate) fn prepare_direct(
        &self,
        resource: &str,
        url: &str,
        method: HttpMethod,
        params: Params,
    ) -> Result<Stage, ApiError> {
        let resource = Arc::clone(self.registry.resource(resource)?);
        self.prepare(resource, Arc::new(MappedCall::direct(method, url, false)), None, params)
    }

    /// Everything up to the transport: parameters, URL, headers, filters,
    /// body and the cache lookup.
    pub(crate) fn prepare(
        &self,
        resource: Arc<ResourceType>,
        call: Arc<MappedCall>,
        target: Option<&ResourceObject>,
        explicit: Params,
    ) -> Result<Stage, ApiError> {
        let started = Instant::now();
        if let Some(target) = target {
            validation::validate(target, resource.validations())?;
        }

        let config = resource.config();
        let mut params = target.map(ResourceObject::to_params).unwrap_or_default();
        params.overlay(&call.options.defaults);
        params.overlay(&explicit);

        let mut ctx = RequestContext::new(resource.name(), &call.name, call.method);
        ctx.route_params(params);
        match &call.options.url {
            Some(url) => ctx.url.clone_from(url),
            None => ctx.expand_template(&call.url_template),
        }

        ctx.headers.set("Accept", ACCEPT_HEADER_VALUE);
        for (name, value) in config.headers.iter_split() {
            ctx.headers.set(name, value);
        }
        ctx.headers.set("User-Agent", config.user_agent.as_str());
        for (name, value) in call.options.headers.iter_split() {
            ctx.headers.set(name, value);
        }

        for filter in resource.before_filters() {
            filter(&call.name, &mut ctx);
        }
        if let Some(forced) = &ctx.forced_url {
            ctx.url = forced.clone();
        }

        ctx.append_get_params()?;
        let encoding = call
            .options
            .request_body_type
            .unwrap_or(config.request_body_type);
        ctx.prepare_body(encoding)?;
        ctx.original_url = ctx.url.clone();

        let url = match (&config.base_url, connection::is_absolute(&ctx.url)) {
            (Some(base), false) => format!("{base}{}", ctx.url),
            _ => ctx.url.clone(),
        };

        let store = self.registry.cache_for(&resource);
        let cache_key = store.map(|_| cache::cache_key(resource.name(), &ctx.original_url));
        let mut cached = None;
        if let (Some(store), Some(key), HttpMethod::Get) = (store, &cache_key, ctx.method) {
            if let Some(entry) = cache::read(store, key) {
                if entry.is_fresh(Utc::now()) {
                    debug!(key = key.as_str(), "cache hit, skipping transport");
                    return Ok(Stage::Ready(entry.result));
                }
                if let Some(etag) = &entry.etag {
                    ctx.headers.set("If-None-Match", etag.as_str());
                }
                cached = Some(entry);
            }
        }

        let fake = call.options.fake.as_ref().map(|fake| {
            let content_type = call
                .options
                .fake_content_type
                .as_deref()
                .unwrap_or(JSON_CONTENT_TYPE);
            RawResponse::new(200, fake.body(&ctx)).with_header("Content-Type", content_type)
        });

        Ok(Stage::Pending(Box::new(Prepared {
            resource,
            call,
            ctx,
            url,
            cache_key,
            cached,
            fake,
            started,
        })))
    }

    /// Send a prepared request. Runs on whichever thread owns `pool`.
    pub(crate) fn dispatch(pool: &ConnectionPool, prepared: &Prepared) -> Result<RawResponse, ApiError> {
        if let Some(fake) = &prepared.fake {
            debug!(url = %prepared.url, "answering with fake response");
            return Ok(fake.clone());
        }
        let resource = &prepared.resource;
        let base_url = resource.config().base_url.as_deref();
        let transport = |ctx: &RequestContext| -> Result<RawResponse, ApiError> {
            let route = pool.resolve(resource.name(), base_url, &ctx.url)?;
            debug!(method = %ctx.method, url = %route.full_url(), "sending request");
            pool.send(&route, ctx)
        };
        let encoding = prepared
            .call
            .options
            .request_body_type
            .unwrap_or(resource.config().request_body_type);
        match resource.proxy() {
            Some(proxy) => proxy.handle(&prepared.ctx, encoding, &transport),
            None => transport(&prepared.ctx),
        }
    }

    /// Everything after the transport: filters, recording, materialization,
    /// caching and status mapping.
    pub(crate) fn complete(
        &self,
        prepared: Prepared,
        outcome: Result<RawResponse, ApiError>,
    ) -> Result<CallResult, ApiError> {
        let Prepared {
            resource,
            call,
            url,
            cache_key,
            cached,
            fake,
            started,
            ..
        } = prepared;
        self.instrumentation
            .record(resource.name(), &call.name, started.elapsed());
        let mut raw = outcome?;

        for filter in resource.after_filters() {
            filter(&call.name, &mut raw);
        }
        if fake.is_none() {
            if let Some(recorder) = resource.recorder() {
                recorder(&url, &raw);
            }
        }
        info!(resource = resource.name(), call = %call.name, status = raw.status, url = %url, "request completed");

        if raw.status == 304 {
            if let Some(entry) = cached {
                debug!(url = %url, "not modified, using cached result");
                return Ok(entry.result);
            }
        }

        let materializer = Materializer {
            resource: resource.name(),
            call: &call,
            translator: resource.translator(),
            url: &url,
        };

        if raw.is_success() {
            let result = if call.options.plain {
                CallResult::Plain(raw.body.clone())
            } else {
                materializer.materialize(&raw)?
            };
            if let (Some(store), Some(key)) = (self.registry.cache_for(&resource), &cache_key) {
                if let Some(entry) = CachedResponse::for_response(&raw, &result) {
                    cache::write(store, key, &entry);
                }
            }
            return Ok(result);
        }

        let body = if raw.body.trim().is_empty() {
            None
        } else if call.options.plain {
            Some(CallResult::Plain(raw.body.clone()))
        } else {
            Some(materializer.materialize(&raw)?)
        };
        Err(ApiError::from_status(raw.status, url, body))
    }
}
