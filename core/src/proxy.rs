//! Request/response rewriting middleware.
//!
//! # Design
//! A `Proxy` is an ordered list of `(method, path pattern, handler)` routes.
//! The first route whose method matches and whose anchored pattern matches
//! the request path receives a `ProxyRequest`. The handler may answer on its
//! own (`Proxy::render`), or edit the request and call `passthrough` to send
//! it on, optionally reshaping the reply with `Proxy::translate`. Requests
//! that match no route go straight to the transport.
//!
//! A `Translator` is the lighter tool: it reshapes the parsed payload of a
//! named call before objects are built from it.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use crate::config::BodyEncoding;
use crate::error::ApiError;
use crate::http::{HeaderList, HttpMethod, RawResponse};
use crate::request::{self, Params, RequestContext};
use crate::xml;

pub type ProxyHandler =
    Arc<dyn Fn(&mut ProxyRequest<'_>) -> Result<RawResponse, ApiError> + Send + Sync>;

/// Sends a (possibly rewritten) request to the real transport.
pub type Transport<'a> = &'a dyn Fn(&RequestContext) -> Result<RawResponse, ApiError>;

struct ProxyRoute {
    method: HttpMethod,
    pattern: Regex,
    handler: ProxyHandler,
}

#[derive(Default)]
pub struct Proxy {
    routes: Vec<ProxyRoute>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes: Vec<String> = self
            .routes
            .iter()
            .map(|r| format!("{} {}", r.method, r.pattern.as_str()))
            .collect();
        f.debug_struct("Proxy").field("routes", &routes).finish()
    }
}

impl Proxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<F>(self, pattern: &str, handler: F) -> Result<Self, ApiError>
    where
        F: Fn(&mut ProxyRequest<'_>) -> Result<RawResponse, ApiError> + Send + Sync + 'static,
    {
        self.route(HttpMethod::Get, pattern, handler)
    }

    pub fn post<F>(self, pattern: &str, handler: F) -> Result<Self, ApiError>
    where
        F: Fn(&mut ProxyRequest<'_>) -> Result<RawResponse, ApiError> + Send + Sync + 'static,
    {
        self.route(HttpMethod::Post, pattern, handler)
    }

    pub fn put<F>(self, pattern: &str, handler: F) -> Result<Self, ApiError>
    where
        F: Fn(&mut ProxyRequest<'_>) -> Result<RawResponse, ApiError> + Send + Sync + 'static,
    {
        self.route(HttpMethod::Put, pattern, handler)
    }

    pub fn delete<F>(self, pattern: &str, handler: F) -> Result<Self, ApiError>
    where
        F: Fn(&mut ProxyRequest<'_>) -> Result<RawResponse, ApiError> + Send + Sync + 'static,
    {
        self.route(HttpMethod::Delete, pattern, handler)
    }

    /// Register a handler for `pattern`, where `:name` segments capture.
    pub fn route<F>(mut self, method: HttpMethod, pattern: &str, handler: F) -> Result<Self, ApiError>
    where
        F: Fn(&mut ProxyRequest<'_>) -> Result<RawResponse, ApiError> + Send + Sync + 'static,
    {
        self.routes.push(ProxyRoute {
            method,
            pattern: compile_pattern(pattern)?,
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    /// Run `ctx` through the first matching route, or send it unchanged.
    pub(crate) fn handle(
        &self,
        ctx: &RequestContext,
        encoding: BodyEncoding,
        transport: Transport<'_>,
    ) -> Result<RawResponse, ApiError> {
        let path = request::path_of(&ctx.url);
        for route in &self.routes {
            if route.method != ctx.method {
                continue;
            }
            let Some(caps) = route.pattern.captures(&path) else {
                continue;
            };
            debug!(method = %ctx.method, path = %path, pattern = route.pattern.as_str(), "proxy route matched");
            let captures = route
                .pattern
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                .collect();
            let mut proxied = ProxyRequest {
                url: ctx.url.clone(),
                get_params: ctx.get_params.clone(),
                post_params: ctx.post_params.clone(),
                body: ctx.body.clone(),
                headers: ctx.headers.clone(),
                captures,
                original: ctx,
                encoding,
                transport,
            };
            return (route.handler)(&mut proxied);
        }
        transport(ctx)
    }

    /// A canned response that never reaches the transport.
    pub fn render(body: impl Into<String>, status: u16, content_type: &str) -> RawResponse {
        RawResponse::new(status, body).with_header("Content-Type", content_type)
    }

    /// Reshape a JSON (or XML) response body with `f`. Empty bodies pass
    /// through untouched; the rewritten body is always JSON.
    pub fn translate<F>(mut response: RawResponse, f: F) -> Result<RawResponse, ApiError>
    where
        F: FnOnce(serde_json::Value) -> serde_json::Value,
    {
        if response.body.trim().is_empty() {
            return Ok(response);
        }
        let is_xml = response.is_xml();
        let parsed = if is_xml {
            xml::parse(&response.body).map_err(|message| ApiError::ResponseParseFailed {
                status: response.status,
                url: String::new(),
                message,
            })?
        } else {
            serde_json::from_str(&response.body).map_err(|err| ApiError::ResponseParseFailed {
                status: response.status,
                url: String::new(),
                message: err.to_string(),
            })?
        };
        response.body = serde_json::to_string(&f(parsed))?;
        if is_xml {
            response.headers.set("Content-Type", request::JSON_CONTENT_TYPE);
        }
        Ok(response)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ApiError> {
    let mut source = String::from("^");
    for (idx, segment) in pattern.split('/').enumerate() {
        if idx > 0 {
            source.push('/');
        }
        match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => {
                source.push_str(&format!("(?P<{name}>[^/]+)"));
            }
            _ => source.push_str(&regex::escape(segment)),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|err| ApiError::InvalidConfig(format!("proxy pattern {pattern}: {err}")))
}

/// The request a proxy handler sees. Edit the public fields, then call
/// `passthrough` to send the rebuilt request.
pub struct ProxyRequest<'a> {
    pub url: String,
    pub get_params: Params,
    pub post_params: Params,
    pub body: Option<String>,
    pub headers: HeaderList,
    captures: IndexMap<String, String>,
    original: &'a RequestContext,
    encoding: BodyEncoding,
    transport: Transport<'a>,
}

impl ProxyRequest<'_> {
    pub fn method(&self) -> HttpMethod {
        self.original.method
    }

    pub fn call_name(&self) -> &str {
        &self.original.call
    }

    /// A `:name` segment captured from the matched pattern.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.captures.get(name).map(String::as_str)
    }

    pub fn original_url(&self) -> &str {
        &self.original.url
    }

    /// Send the request on. Only the parts the handler changed are rebuilt:
    /// a new URL replaces the old, a new body wins over changed post params
    /// (which are otherwise re-encoded), and changed get params replace the
    /// query string.
    pub fn passthrough(&self) -> Result<RawResponse, ApiError> {
        let mut ctx = self.original.clone();
        ctx.headers = self.headers.clone();
        if self.url != self.original.url {
            ctx.url = self.url.clone();
        }
        if self.body != self.original.body {
            ctx.body = self.body.clone();
        } else if self.post_params != self.original.post_params {
            ctx.body = Some(request::encode_body(&self.post_params, self.encoding)?);
            ctx.post_params = self.post_params.clone();
        }
        if self.get_params != self.original.get_params {
            let base = request::strip_query(&ctx.url).to_string();
            ctx.url = request::append_query(&base, &self.get_params)?;
            ctx.get_params = self.get_params.clone();
        }
        (self.transport)(&ctx)
    }
}

/// Per-call payload rewriters applied before materialization.
#[derive(Clone, Default)]
pub struct Translator {
    handlers: IndexMap<String, Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>>,
}

impl fmt::Debug for Translator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translator")
            .field("calls", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, call: &str, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.handlers.insert(call.to_string(), Arc::new(f));
        self
    }

    /// Calls without a handler get their payload back unchanged.
    pub fn apply(&self, call: &str, value: serde_json::Value) -> serde_json::Value {
        match self.handlers.get(call) {
            Some(handler) => handler(value),
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn context(method: HttpMethod, url: &str) -> RequestContext {
        let mut ctx = RequestContext::new("Person", "find", method);
        ctx.url = url.to_string();
        ctx.original_url = url.to_string();
        ctx
    }

    fn recording<'a>(seen: &'a Mutex<Vec<RequestContext>>) -> impl Fn(&RequestContext) -> Result<RawResponse, ApiError> + 'a {
        move |ctx| {
            seen.lock().push(ctx.clone());
            Ok(RawResponse::new(200, r#"{"first_name":"Billy"}"#))
        }
    }

    #[test]
    fn unmatched_requests_pass_straight_through() {
        let proxy = Proxy::new()
            .get("/change-format", |_| Ok(Proxy::render("{}", 200, "application/json")))
            .unwrap();
        let seen = Mutex::new(Vec::new());
        let transport = recording(&seen);
        let ctx = context(HttpMethod::Get, "/people/1");
        proxy.handle(&ctx, BodyEncoding::FormEncoded, &transport).unwrap();
        assert_eq!(seen.lock()[0].url, "/people/1");
    }

    #[test]
    fn method_must_match() {
        let proxy = Proxy::new()
            .post("/people/:id", |_| Ok(Proxy::render("{}", 201, "application/json")))
            .unwrap();
        let seen = Mutex::new(Vec::new());
        let transport = recording(&seen);
        let response = proxy
            .handle(&context(HttpMethod::Get, "/people/1"), BodyEncoding::FormEncoded, &transport)
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn render_answers_without_the_transport() {
        let proxy = Proxy::new()
            .get("/hal_test/:id", |req| {
                let body = json!({"id": req.param("id")}).to_string();
                Ok(Proxy::render(body, 200, "application/hal+json"))
            })
            .unwrap();
        let seen = Mutex::new(Vec::new());
        let transport = recording(&seen);
        let response = proxy
            .handle(&context(HttpMethod::Get, "/hal_test/42"), BodyEncoding::FormEncoded, &transport)
            .unwrap();
        assert_eq!(response.body, r#"{"id":"42"}"#);
        assert_eq!(response.content_type(), Some("application/hal+json"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn passthrough_rebuilds_only_what_changed() {
        let proxy = Proxy::new()
            .get("/change", |req| {
                req.url = "/fake".to_string();
                req.get_params = Params::new().with("id", 1234).with("name", "John");
                req.passthrough()
            })
            .unwrap();
        let seen = Mutex::new(Vec::new());
        let transport = recording(&seen);
        let mut ctx = context(HttpMethod::Get, "/change?id=1");
        ctx.get_params = Params::new().with("id", 1);
        proxy.handle(&ctx, BodyEncoding::FormEncoded, &transport).unwrap();
        assert_eq!(seen.lock()[0].url, "/fake?id=1234&name=John");
    }

    #[test]
    fn passthrough_reencodes_changed_post_params() {
        let proxy = Proxy::new()
            .post("/create", |req| {
                req.post_params.insert("age", 21);
                req.passthrough()
            })
            .unwrap();
        let seen = Mutex::new(Vec::new());
        let transport = recording(&seen);
        let mut ctx = context(HttpMethod::Post, "/create");
        ctx.post_params = Params::new().with("name", "Billy");
        ctx.body = Some("name=Billy".to_string());
        proxy.handle(&ctx, BodyEncoding::FormEncoded, &transport).unwrap();
        assert_eq!(seen.lock()[0].body.as_deref(), Some("age=21&name=Billy"));
    }

    #[test]
    fn explicit_body_wins_over_params() {
        let proxy = Proxy::new()
            .post("/create", |req| {
                req.post_params.insert("age", 21);
                req.body = Some("MY-BODY-CONTENT".to_string());
                req.passthrough()
            })
            .unwrap();
        let seen = Mutex::new(Vec::new());
        let transport = recording(&seen);
        let mut ctx = context(HttpMethod::Post, "/create");
        ctx.body = Some(String::new());
        proxy.handle(&ctx, BodyEncoding::FormEncoded, &transport).unwrap();
        assert_eq!(seen.lock()[0].body.as_deref(), Some("MY-BODY-CONTENT"));
    }

    #[test]
    fn translate_reshapes_json_bodies() {
        let response = RawResponse::new(200, r#"{"MiddleName":"Jon"}"#);
        let translated = Proxy::translate(response, |mut body| {
            body["middle_name"] = body["MiddleName"].take();
            body
        })
        .unwrap();
        let body: serde_json::Value = serde_json::from_str(&translated.body).unwrap();
        assert_eq!(body["middle_name"], "Jon");
    }

    #[test]
    fn translate_skips_empty_bodies() {
        let response = RawResponse::new(204, "");
        let translated = Proxy::translate(response.clone(), |_| json!({"never": true})).unwrap();
        assert_eq!(translated, response);
    }

    #[test]
    fn translator_only_touches_named_calls() {
        let translator = Translator::new().on("all", |body| json!({"wrapped": body}));
        assert_eq!(translator.apply("all", json!(1)), json!({"wrapped": 1}));
        assert_eq!(translator.apply("find", json!(1)), json!(1));
    }

    #[test]
    fn bad_patterns_are_config_errors() {
        assert!(matches!(
            Proxy::new().get("/people/:bad-name", |_| Ok(Proxy::render("", 200, "text/plain"))),
            Err(ApiError::InvalidConfig(_))
        ));
    }
}
