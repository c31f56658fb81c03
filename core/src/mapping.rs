//! Resource type declarations and the registry that holds them.
//!
//! # Design
//! A `ResourceType` is declared once through `ResourceTypeBuilder` and never
//! mutated afterwards. Mapped calls form an append-only table keyed by call
//! name. The `Registry` composes every type's effective configuration when
//! it is built and is then shared read-only (behind an `Arc`) by every
//! `Client`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::cache::CacheStore;
use crate::config::{BodyEncoding, ClientDefaults, ConfigOverrides, ResourceConfig};
use crate::error::ApiError;
use crate::http::{HeaderList, HttpMethod, RawResponse};
use crate::proxy::{Proxy, Translator};
use crate::request::{Params, RequestContext};
use crate::validation::Rule;

pub type BeforeFilter = Arc<dyn Fn(&str, &mut RequestContext) + Send + Sync>;
pub type AfterFilter = Arc<dyn Fn(&str, &mut RawResponse) + Send + Sync>;
pub type ResponseRecorder = Arc<dyn Fn(&str, &RawResponse) + Send + Sync>;

/// A stubbed response body that bypasses the transport.
#[derive(Clone)]
pub enum FakeResponse {
    Static(String),
    Dynamic(Arc<dyn Fn(&RequestContext) -> String + Send + Sync>),
}

impl FakeResponse {
    pub fn body(&self, ctx: &RequestContext) -> String {
        match self {
            FakeResponse::Static(body) => body.clone(),
            FakeResponse::Dynamic(f) => f(ctx),
        }
    }
}

impl fmt::Debug for FakeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FakeResponse::Static(body) => f.debug_tuple("Static").field(body).finish(),
            FakeResponse::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub defaults: Params,
    /// Fields kept as lazy loaders, each with an optional target type.
    pub lazy: IndexMap<String, Option<String>>,
    pub has_many: IndexMap<String, String>,
    pub has_one: IndexMap<String, String>,
    pub fake: Option<FakeResponse>,
    pub fake_content_type: Option<String>,
    pub request_body_type: Option<BodyEncoding>,
    /// Fixed URL used instead of the template.
    pub url: Option<String>,
    pub headers: HeaderList,
    pub ignore_xml_root: Option<String>,
    /// Return the body untouched instead of materializing it.
    pub plain: bool,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defaults(mut self, defaults: Params) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn lazy(mut self, field: &str) -> Self {
        self.lazy.insert(field.to_string(), None);
        self
    }

    pub fn lazy_as(mut self, field: &str, resource_type: &str) -> Self {
        self.lazy.insert(field.to_string(), Some(resource_type.to_string()));
        self
    }

    pub fn has_many(mut self, field: &str, resource_type: &str) -> Self {
        self.has_many.insert(field.to_string(), resource_type.to_string());
        self
    }

    pub fn has_one(mut self, field: &str, resource_type: &str) -> Self {
        self.has_one.insert(field.to_string(), resource_type.to_string());
        self
    }

    pub fn fake(mut self, body: impl Into<String>) -> Self {
        self.fake = Some(FakeResponse::Static(body.into()));
        self
    }

    pub fn fake_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        self.fake = Some(FakeResponse::Dynamic(Arc::new(f)));
        self
    }

    pub fn fake_content_type(mut self, content_type: &str) -> Self {
        self.fake_content_type = Some(content_type.to_string());
        self
    }

    pub fn request_body_type(mut self, encoding: BodyEncoding) -> Self {
        self.request_body_type = Some(encoding);
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn ignore_xml_root(mut self, root: &str) -> Self {
        self.ignore_xml_root = Some(root.to_string());
        self
    }

    pub fn plain(mut self) -> Self {
        self.plain = true;
        self
    }

    pub fn is_lazy(&self, field: &str) -> bool {
        self.lazy.contains_key(field)
    }
}

/// An immutable endpoint declaration.
#[derive(Debug, Clone)]
pub struct MappedCall {
    pub name: String,
    pub method: HttpMethod,
    pub url_template: String,
    pub options: CallOptions,
}

impl MappedCall {
    pub fn new(name: &str, method: HttpMethod, url_template: &str, options: CallOptions) -> Self {
        Self {
            name: name.to_string(),
            method,
            url_template: url_template.to_string(),
            options,
        }
    }

    /// Ad-hoc descriptor for `Client::request` and lazy loads.
    pub(crate) fn direct(method: HttpMethod, url: &str, plain: bool) -> Self {
        let mut options = CallOptions::new().url(url);
        options.plain = plain;
        Self::new("_request", method, url, options)
    }
}

pub struct ResourceType {
    name: String,
    overrides: ConfigOverrides,
    config: ResourceConfig,
    calls: IndexMap<String, Arc<MappedCall>>,
    before_filters: Vec<BeforeFilter>,
    after_filters: Vec<AfterFilter>,
    validations: Vec<(String, Rule)>,
    proxy: Option<Arc<Proxy>>,
    translator: Option<Arc<Translator>>,
    recorder: Option<ResponseRecorder>,
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("calls", &self.calls.keys().collect::<Vec<_>>())
            .field("before_filters", &self.before_filters.len())
            .field("after_filters", &self.after_filters.len())
            .field("validations", &self.validations)
            .field("proxy", &self.proxy)
            .field("translator", &self.translator)
            .finish()
    }
}

impl ResourceType {
    pub fn builder(name: &str) -> ResourceTypeBuilder {
        ResourceTypeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn mapped_call(&self, name: &str) -> Result<&Arc<MappedCall>, ApiError> {
        self.calls.get(name).ok_or_else(|| ApiError::UnknownCall {
            resource: self.name.clone(),
            call: name.to_string(),
        })
    }

    pub fn mapped_calls(&self) -> impl Iterator<Item = &MappedCall> {
        self.calls.values().map(AsRef::as_ref)
    }

    pub fn before_filters(&self) -> &[BeforeFilter] {
        &self.before_filters
    }

    pub fn after_filters(&self) -> &[AfterFilter] {
        &self.after_filters
    }

    pub fn validations(&self) -> &[(String, Rule)] {
        &self.validations
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_deref()
    }

    pub fn translator(&self) -> Option<&Translator> {
        self.translator.as_deref()
    }

    pub fn recorder(&self) -> Option<&ResponseRecorder> {
        self.recorder.as_ref()
    }
}

/// Declares a `ResourceType`.
///
/// ```ignore
/// let person = ResourceType::builder("Person")
///     .base_url("http://www.example.com")
///     .get("find", "/find/:id")
///     .post_with("create", "/create", CallOptions::new().request_body_type(BodyEncoding::Json))
///     .build()?;
/// ```
pub struct ResourceTypeBuilder {
    inner: ResourceType,
    error: Option<ApiError>,
}

impl ResourceTypeBuilder {
    fn new(name: &str) -> Self {
        Self {
            inner: ResourceType {
                name: name.to_string(),
                overrides: ConfigOverrides::default(),
                config: ResourceConfig::default(),
                calls: IndexMap::new(),
                before_filters: Vec::new(),
                after_filters: Vec::new(),
                validations: Vec::new(),
                proxy: None,
                translator: None,
                recorder: None,
            },
            error: None,
        }
    }

    /// Start from everything `parent` declares. Call this before any of the
    /// child's own declarations; inherited filters run first.
    pub fn inherit(mut self, parent: &ResourceType) -> Self {
        self.inner.overrides.inherit_from(&parent.overrides);
        for (name, call) in &parent.calls {
            self.inner.calls.entry(name.clone()).or_insert_with(|| Arc::clone(call));
        }
        let mut before = parent.before_filters.clone();
        before.append(&mut self.inner.before_filters);
        self.inner.before_filters = before;
        let mut after = parent.after_filters.clone();
        after.append(&mut self.inner.after_filters);
        self.inner.after_filters = after;
        let mut validations = parent.validations.clone();
        validations.append(&mut self.inner.validations);
        self.inner.validations = validations;
        if self.inner.proxy.is_none() {
            self.inner.proxy.clone_from(&parent.proxy);
        }
        if self.inner.translator.is_none() {
            self.inner.translator.clone_from(&parent.translator);
        }
        if self.inner.recorder.is_none() {
            self.inner.recorder.clone_from(&parent.recorder);
        }
        self
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.inner.overrides.base_url = Some(url.to_string());
        self
    }

    pub fn perform_caching(mut self, enabled: bool) -> Self {
        self.inner.overrides.perform_caching = Some(enabled);
        self
    }

    pub fn request_body_type(mut self, encoding: BodyEncoding) -> Self {
        self.inner.overrides.request_body_type = Some(encoding);
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.inner.overrides.user_agent = Some(user_agent.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.inner.overrides.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(self, name: &str, template: &str) -> Self {
        self.add(name, HttpMethod::Get, template, CallOptions::default())
    }

    pub fn put(self, name: &str, template: &str) -> Self {
        self.add(name, HttpMethod::Put, template, CallOptions::default())
    }

    pub fn post(self, name: &str, template: &str) -> Self {
        self.add(name, HttpMethod::Post, template, CallOptions::default())
    }

    pub fn delete(self, name: &str, template: &str) -> Self {
        self.add(name, HttpMethod::Delete, template, CallOptions::default())
    }

    pub fn get_with(self, name: &str, template: &str, options: CallOptions) -> Self {
        self.add(name, HttpMethod::Get, template, options)
    }

    pub fn put_with(self, name: &str, template: &str, options: CallOptions) -> Self {
        self.add(name, HttpMethod::Put, template, options)
    }

    pub fn post_with(self, name: &str, template: &str, options: CallOptions) -> Self {
        self.add(name, HttpMethod::Post, template, options)
    }

    pub fn delete_with(self, name: &str, template: &str, options: CallOptions) -> Self {
        self.add(name, HttpMethod::Delete, template, options)
    }

    /// Declare a call from a verb string; unsupported verbs fail `build`.
    pub fn map(mut self, verb: &str, name: &str, template: &str, options: CallOptions) -> Self {
        match HttpMethod::from_str(verb) {
            Ok(method) => self.add(name, method, template, options),
            Err(err) => {
                self.error.get_or_insert(err);
                self
            }
        }
    }

    fn add(mut self, name: &str, method: HttpMethod, template: &str, options: CallOptions) -> Self {
        self.inner
            .calls
            .insert(name.to_string(), Arc::new(MappedCall::new(name, method, template, options)));
        self
    }

    pub fn before_request<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &mut RequestContext) + Send + Sync + 'static,
    {
        self.inner.before_filters.push(Arc::new(filter));
        self
    }

    pub fn after_request<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &mut RawResponse) + Send + Sync + 'static,
    {
        self.inner.after_filters.push(Arc::new(filter));
        self
    }

    pub fn record_response<F>(mut self, recorder: F) -> Self
    where
        F: Fn(&str, &RawResponse) + Send + Sync + 'static,
    {
        self.inner.recorder = Some(Arc::new(recorder));
        self
    }

    pub fn validates(mut self, field: &str, rule: Rule) -> Self {
        self.inner.validations.push((field.to_string(), rule));
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.inner.proxy = Some(Arc::new(proxy));
        self
    }

    pub fn translator(mut self, translator: Translator) -> Self {
        self.inner.translator = Some(Arc::new(translator));
        self
    }

    pub fn build(self) -> Result<ResourceType, ApiError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.inner),
        }
    }
}

/// Every declared resource type plus the shared defaults and cache store.
pub struct Registry {
    defaults: ClientDefaults,
    types: IndexMap<String, Arc<ResourceType>>,
    cache_store: Option<Arc<dyn CacheStore>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("defaults", &self.defaults)
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .field("cache_store", &self.cache_store.is_some())
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn defaults(&self) -> &ClientDefaults {
        &self.defaults
    }

    pub fn resource(&self, name: &str) -> Result<&Arc<ResourceType>, ApiError> {
        self.types
            .get(name)
            .ok_or_else(|| ApiError::UnknownResource(name.to_string()))
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn cache_store(&self) -> Option<&dyn CacheStore> {
        self.cache_store.as_deref()
    }

    /// The store to use for `resource`, if caching is on for it.
    pub(crate) fn cache_for(&self, resource: &ResourceType) -> Option<&dyn CacheStore> {
        if resource.config.perform_caching {
            self.cache_store()
        } else {
            None
        }
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    defaults: ClientDefaults,
    types: Vec<ResourceType>,
    cache_store: Option<Arc<dyn CacheStore>>,
}

impl RegistryBuilder {
    pub fn defaults(mut self, defaults: ClientDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn register(mut self, resource: ResourceType) -> Self {
        self.types.push(resource);
        self
    }

    pub fn build(self) -> Result<Arc<Registry>, ApiError> {
        let mut types = IndexMap::new();
        for mut resource in self.types {
            resource.config = ResourceConfig::compose(&self.defaults, &resource.overrides);
            let name = resource.name.clone();
            if types.insert(name.clone(), Arc::new(resource)).is_some() {
                return Err(ApiError::InvalidConfig(format!("resource type {name} registered twice")));
            }
        }
        Ok(Arc::new(Registry {
            defaults: self.defaults,
            types,
            cache_store: self.cache_store,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;

    #[test]
    fn declares_calls_in_order() {
        let person = ResourceType::builder("Person")
            .get("find", "/find/:id")
            .post("create", "/create")
            .build()
            .unwrap();
        let names: Vec<_> = person.mapped_calls().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["find", "create"]);
        assert_eq!(person.mapped_call("create").unwrap().method, HttpMethod::Post);
        assert!(matches!(
            person.mapped_call("missing"),
            Err(ApiError::UnknownCall { ref call, .. }) if call == "missing"
        ));
    }

    #[test]
    fn unsupported_verbs_fail_the_build() {
        let err = ResourceType::builder("Person")
            .map("patch", "update", "/people/:id", CallOptions::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequestMethod(ref m) if m == "patch"));
    }

    #[test]
    fn registry_composes_config_at_build_time() {
        let registry = Registry::builder()
            .defaults(ClientDefaults {
                base_url: Some("http://global.example.com".into()),
                perform_caching: true,
                ..ClientDefaults::default()
            })
            .cache_store(Arc::new(MemoryCacheStore::default()))
            .register(ResourceType::builder("Person").build().unwrap())
            .register(
                ResourceType::builder("Address")
                    .base_url("http://addresses.example.com")
                    .perform_caching(false)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let person = registry.resource("Person").unwrap();
        assert_eq!(person.config().base_url.as_deref(), Some("http://global.example.com"));
        assert!(registry.cache_for(person).is_some());
        let address = registry.resource("Address").unwrap();
        assert_eq!(address.config().base_url.as_deref(), Some("http://addresses.example.com"));
        assert!(registry.cache_for(address).is_none());
        assert!(matches!(registry.resource("Nope"), Err(ApiError::UnknownResource(_))));
    }

    #[test]
    fn duplicate_types_are_rejected() {
        let result = Registry::builder()
            .register(ResourceType::builder("Person").build().unwrap())
            .register(ResourceType::builder("Person").build().unwrap())
            .build();
        assert!(matches!(result, Err(ApiError::InvalidConfig(_))));
    }

    #[test]
    fn children_inherit_parent_declarations_first() {
        let parent = ResourceType::builder("Base")
            .base_url("http://www.example.com")
            .get("all", "/")
            .before_request(|_, ctx| ctx.headers.set("X-Order", "parent"))
            .build()
            .unwrap();
        let child = ResourceType::builder("Person")
            .inherit(&parent)
            .get("find", "/people/:id")
            .before_request(|_, ctx| ctx.headers.set("X-Order", "child"))
            .build()
            .unwrap();
        assert_eq!(child.mapped_calls().count(), 2);
        assert_eq!(child.before_filters().len(), 2);

        let mut ctx = RequestContext::new("Person", "find", HttpMethod::Get);
        for filter in child.before_filters() {
            filter("find", &mut ctx);
        }
        assert_eq!(ctx.headers.get_str("x-order"), Some("child"));

        let registry = Registry::builder().register(child).build().unwrap();
        let person = registry.resource("Person").unwrap();
        assert_eq!(person.config().base_url.as_deref(), Some("http://www.example.com"));
    }
}
